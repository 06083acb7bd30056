//! Process supervisor: start, pause, resume, and stop agent processes.
//!
//! The supervisor owns the in-memory tracking table mapping agent ids to
//! live child processes. The child handle itself lives inside its exit
//! watcher task (see [`super::child_monitor`]); the table keeps the pid,
//! the exit channel, and the kill trigger.
//!
//! Stopping is graceful first: `SIGTERM`, then a race between the exit
//! event and the grace period, then a forced kill and a short settle wait.
//! `stop_all` bounds the whole fleet by a timeout and force-kills whatever
//! remains, so no entry survives in the table once it returns.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, info_span, warn, Instrument};

use super::child_monitor::{spawn_exit_watcher, ExitReport, ExitWatch, ProcessEvent};
use super::record_transition;
use super::signals::{self, ProcessSignal, SUPPORTS_GRACEFUL_TERMINATE, SUPPORTS_SUSPEND};
use super::spawner::spawn_agent_process;
use crate::config::{AgentConfig, GlobalConfig};
use crate::models::session::{AgentSession, AgentStatus, SessionPatch};
use crate::persistence::{SessionReader, SessionStore, TransitionLog};
use crate::{AppError, Result};

const EVENT_CAPACITY: usize = 64;

/// In-memory record of one live agent process.
pub(crate) struct TrackedProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: Instant,
    stopping: Arc<AtomicBool>,
    exit_rx: watch::Receiver<Option<ExitReport>>,
    kill: Arc<Notify>,
}

/// Tracking table shared between the supervisor and the exit watchers.
pub(crate) type TrackedTable = Arc<Mutex<HashMap<u32, TrackedProcess>>>;

fn table(tracked: &TrackedTable) -> MutexGuard<'_, HashMap<u32, TrackedProcess>> {
    tracked.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Remove `agent_id` from the table if the entry still belongs to
/// `generation`. A newer process started under the same id is left alone.
pub(crate) fn untrack(tracked: &TrackedTable, agent_id: u32, generation: u64) -> bool {
    let mut entries = table(tracked);
    match entries.get(&agent_id) {
        Some(entry) if entry.generation == generation => {
            entries.remove(&agent_id);
            true
        }
        _ => false,
    }
}

/// How a single `stop` call ended.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// No process was tracked for the agent.
    NotTracked,
    /// The process exited within the grace period.
    Exited,
    /// The process had to be force-killed.
    Killed,
}

/// Result of [`ProcessSupervisor::stop_all`].
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StopAllReport {
    /// Agents whose stop completed.
    pub stopped: Vec<u32>,
    /// Agents force-killed after the timeout.
    pub forced: Vec<u32>,
    /// Whether the aggregate timeout elapsed.
    pub timed_out: bool,
}

impl StopAllReport {
    /// Every agent that was running when `stop_all` began.
    #[must_use]
    pub fn total(&self) -> usize {
        self.stopped.len() + self.forced.len()
    }
}

/// Per-process figures reported by [`ProcessSupervisor::stats`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AgentProcessStats {
    /// OS process id, if still known.
    pub pid: Option<u32>,
    /// Milliseconds since the process was spawned.
    pub uptime_ms: u64,
}

/// Fleet summary.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SupervisorStats {
    /// Number of tracked processes.
    pub count: usize,
    /// Tracked processes grouped by session status.
    pub by_status: BTreeMap<String, usize>,
    /// Per-agent process details.
    pub per_agent: BTreeMap<u32, AgentProcessStats>,
}

/// Owns the lifecycle of every agent process.
pub struct ProcessSupervisor {
    sessions: Arc<SessionStore>,
    transitions: Arc<TransitionLog>,
    agent: AgentConfig,
    workspace_root: PathBuf,
    grace_period: Duration,
    kill_settle: Duration,
    supports_suspend: bool,
    tracked: TrackedTable,
    generation: AtomicU64,
    start_lock: AsyncMutex<()>,
    events: broadcast::Sender<ProcessEvent>,
}

impl ProcessSupervisor {
    /// Build a supervisor from configuration.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        sessions: Arc<SessionStore>,
        transitions: Arc<TransitionLog>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions,
            transitions,
            agent: config.agent.clone(),
            workspace_root: config.workspace_root.clone(),
            grace_period: config.grace_period(),
            kill_settle: config.kill_settle(),
            supports_suspend: SUPPORTS_SUSPEND,
            tracked: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            start_lock: AsyncMutex::new(()),
            events,
        }
    }

    /// Override the suspend capability; without it `pause` only changes
    /// the recorded status.
    #[must_use]
    pub fn with_suspend_support(mut self, supported: bool) -> Self {
        self.supports_suspend = supported && SUPPORTS_SUSPEND;
        self
    }

    /// Whether `pause` suspends the OS process.
    #[must_use]
    pub fn supports_suspend(&self) -> bool {
        self.supports_suspend
    }

    /// Subscribe to classified process exits.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.events.subscribe()
    }

    /// Create the agent's session and spawn its work process.
    ///
    /// # Errors
    ///
    /// - `AppError::AlreadyRunning` if a process is tracked for the id.
    /// - `AppError::SessionConflict` if the stored session looks live.
    /// - `AppError::Spawn` if the process cannot start; the failure is
    ///   recorded on the session before returning.
    pub async fn start(&self, agent_id: u32) -> Result<AgentSession> {
        async {
            let _guard = self.start_lock.lock().await;

            if self.is_running(agent_id) {
                return Err(AppError::AlreadyRunning(agent_id));
            }

            let session = self.sessions.create(agent_id).await?;
            let session_file = self.sessions.path_for(agent_id);
            let child = match spawn_agent_process(
                &self.agent,
                &self.workspace_root,
                agent_id,
                &session_file,
            ) {
                Ok(child) => child,
                Err(err) => {
                    if let Err(record_err) =
                        self.sessions.record_error(agent_id, err.to_string()).await
                    {
                        warn!(agent_id, %record_err, "failed to record spawn failure");
                    }
                    return Err(err);
                }
            };

            let pid = child.id();
            let generation = self.generation.fetch_add(1, Ordering::SeqCst);
            let (exit_tx, exit_rx) = watch::channel(None);
            let kill = Arc::new(Notify::new());
            let stopping = Arc::new(AtomicBool::new(false));

            table(&self.tracked).insert(
                agent_id,
                TrackedProcess {
                    generation,
                    pid,
                    started_at: Instant::now(),
                    stopping: Arc::clone(&stopping),
                    exit_rx,
                    kill: Arc::clone(&kill),
                },
            );

            // Detached: the watcher ends when the child exits.
            drop(spawn_exit_watcher(ExitWatch {
                agent_id,
                generation,
                child,
                kill,
                exit_tx,
                stopping,
                tracked: Arc::clone(&self.tracked),
                sessions: Arc::clone(&self.sessions),
                transitions: Arc::clone(&self.transitions),
                events: self.events.clone(),
            }));

            info!(agent_id, ?pid, "agent started");
            Ok(session)
        }
        .instrument(info_span!("start_agent", agent_id))
        .await
    }

    /// Mark the agent paused and suspend its process where supported.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotRunning` if no process is tracked, or the
    /// storage/signal error if either step fails.
    pub async fn pause(&self, agent_id: u32) -> Result<AgentSession> {
        async {
            let pid = self
                .pid_of(agent_id)
                .ok_or(AppError::NotRunning(agent_id))?;

            let previous = self.sessions.read(agent_id).await?;
            let session = self
                .sessions
                .update(agent_id, SessionPatch::status(AgentStatus::Paused))
                .await?;
            if let Some(previous) = previous {
                record_transition(
                    &self.transitions,
                    agent_id,
                    previous.status,
                    AgentStatus::Paused,
                    session.current_work_item.clone(),
                );
            }

            match pid {
                Some(pid) if self.supports_suspend => {
                    signals::send(pid, ProcessSignal::Suspend)?;
                    info!(agent_id, pid, "agent paused");
                }
                _ => info!(agent_id, "agent paused (status only)"),
            }
            Ok(session)
        }
        .instrument(info_span!("pause_agent", agent_id))
        .await
    }

    /// Resume a paused agent and return it to idle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotPaused` unless the session status is `paused`.
    pub async fn resume(&self, agent_id: u32) -> Result<AgentSession> {
        async {
            let current = self.sessions.read(agent_id).await?;
            if current.as_ref().map(|s| s.status) != Some(AgentStatus::Paused) {
                return Err(AppError::NotPaused(agent_id));
            }

            if self.supports_suspend {
                if let Some(pid) = self.pid_of(agent_id).flatten() {
                    signals::send(pid, ProcessSignal::Continue)?;
                }
            }

            let session = self
                .sessions
                .update(agent_id, SessionPatch::status(AgentStatus::Idle))
                .await?;
            record_transition(
                &self.transitions,
                agent_id,
                AgentStatus::Paused,
                AgentStatus::Idle,
                session.current_work_item.clone(),
            );
            info!(agent_id, "agent resumed");
            Ok(session)
        }
        .instrument(info_span!("resume_agent", agent_id))
        .await
    }

    /// Stop the agent's process and return its session to idle.
    ///
    /// Stopping an untracked agent is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the session cannot be updated afterwards.
    pub async fn stop(&self, agent_id: u32) -> Result<StopOutcome> {
        async {
            let Some((generation, pid, exit_rx, kill)) = self.begin_stop(agent_id) else {
                debug!(agent_id, "stop requested for untracked agent");
                return Ok(StopOutcome::NotTracked);
            };

            let outcome = self.terminate(agent_id, pid, exit_rx, &kill).await;
            untrack(&self.tracked, agent_id, generation);
            self.mark_stopped(agent_id).await?;

            info!(agent_id, ?outcome, "agent stopped");
            Ok(outcome)
        }
        .instrument(info_span!("stop_agent", agent_id))
        .await
    }

    /// Stop every tracked agent concurrently, bounded by `timeout`.
    ///
    /// Whatever has not been observed to exit when the timeout elapses is
    /// force-killed and untracked before this returns.
    pub async fn stop_all(&self, timeout: Duration) -> StopAllReport {
        let agents = self.tracked_agents();
        info!(count = agents.len(), ?timeout, "stopping all agents");

        let stops = agents
            .iter()
            .map(|&agent_id| async move { (agent_id, self.stop(agent_id).await) });
        let mut report = StopAllReport::default();

        match tokio::time::timeout(timeout, join_all(stops)).await {
            Ok(results) => {
                for (agent_id, result) in results {
                    match result {
                        Ok(StopOutcome::NotTracked) => {}
                        Ok(_) => report.stopped.push(agent_id),
                        Err(err) => {
                            warn!(agent_id, %err, "stop finished with an error");
                            report.stopped.push(agent_id);
                        }
                    }
                }
            }
            Err(_) => {
                warn!(?timeout, "stop-all timed out, forcing remaining agents");
                report.timed_out = true;
            }
        }

        report.forced = self.force_kill_remaining().await;
        if report.timed_out {
            // Cancelled stops may have skipped their session update.
            for &agent_id in &agents {
                if !report.forced.contains(&agent_id) {
                    report.stopped.push(agent_id);
                }
                if let Err(err) = self.mark_stopped(agent_id).await {
                    warn!(agent_id, %err, "failed to mark agent stopped");
                }
            }
        }

        info!(
            stopped = report.stopped.len(),
            forced = report.forced.len(),
            timed_out = report.timed_out,
            "stop-all complete"
        );
        report
    }

    /// Whether a live process is tracked for `agent_id`.
    #[must_use]
    pub fn is_running(&self, agent_id: u32) -> bool {
        table(&self.tracked).contains_key(&agent_id)
    }

    /// Ids of every tracked agent, ascending.
    #[must_use]
    pub fn tracked_agents(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = table(&self.tracked).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Count, status breakdown, and per-process details of the fleet.
    pub async fn stats(&self) -> SupervisorStats {
        let processes: Vec<(u32, Option<u32>, Duration)> = table(&self.tracked)
            .iter()
            .map(|(&id, entry)| (id, entry.pid, entry.started_at.elapsed()))
            .collect();

        let mut stats = SupervisorStats {
            count: processes.len(),
            ..SupervisorStats::default()
        };
        for (agent_id, pid, uptime) in processes {
            let status = match self.sessions.read(agent_id).await {
                Ok(Some(session)) => session.status.to_string(),
                Ok(None) => "unknown".to_owned(),
                Err(err) => {
                    warn!(agent_id, %err, "cannot read session for stats");
                    "unknown".to_owned()
                }
            };
            *stats.by_status.entry(status).or_insert(0) += 1;
            stats.per_agent.insert(
                agent_id,
                AgentProcessStats {
                    pid,
                    uptime_ms: u64::try_from(uptime.as_millis()).unwrap_or(u64::MAX),
                },
            );
        }
        stats
    }

    fn pid_of(&self, agent_id: u32) -> Option<Option<u32>> {
        table(&self.tracked).get(&agent_id).map(|entry| entry.pid)
    }

    /// Flag the entry as stopping and hand back what `terminate` needs.
    #[allow(clippy::type_complexity)]
    fn begin_stop(
        &self,
        agent_id: u32,
    ) -> Option<(u64, Option<u32>, watch::Receiver<Option<ExitReport>>, Arc<Notify>)> {
        let entries = table(&self.tracked);
        let entry = entries.get(&agent_id)?;
        entry.stopping.store(true, Ordering::SeqCst);
        Some((
            entry.generation,
            entry.pid,
            entry.exit_rx.clone(),
            Arc::clone(&entry.kill),
        ))
    }

    async fn terminate(
        &self,
        agent_id: u32,
        pid: Option<u32>,
        mut exit_rx: watch::Receiver<Option<ExitReport>>,
        kill: &Notify,
    ) -> StopOutcome {
        if let Some(pid) = pid.filter(|_| SUPPORTS_GRACEFUL_TERMINATE) {
            // A suspended process would not act on SIGTERM.
            if self.supports_suspend {
                if let Err(err) = signals::send(pid, ProcessSignal::Continue) {
                    debug!(agent_id, %err, "continue before terminate failed");
                }
            }
            if let Err(err) = signals::send(pid, ProcessSignal::Terminate) {
                debug!(agent_id, %err, "terminate signal failed");
            }
            if wait_for_exit(&mut exit_rx, self.grace_period).await {
                return StopOutcome::Exited;
            }
            warn!(
                agent_id,
                grace_ms = self.grace_period.as_millis(),
                "agent did not exit within grace period, forcing kill"
            );
        }

        kill.notify_one();
        if !wait_for_exit(&mut exit_rx, self.kill_settle).await {
            warn!(agent_id, "agent exit not observed after kill");
        }
        StopOutcome::Killed
    }

    /// Drain the table, kill every entry, and wait for the kills to settle.
    async fn force_kill_remaining(&self) -> Vec<u32> {
        let drained: Vec<(u32, TrackedProcess)> = table(&self.tracked).drain().collect();
        if drained.is_empty() {
            return Vec::new();
        }

        let mut ids = Vec::with_capacity(drained.len());
        let mut waits = Vec::with_capacity(drained.len());
        for (agent_id, entry) in drained {
            entry.stopping.store(true, Ordering::SeqCst);
            entry.kill.notify_one();
            warn!(agent_id, pid = ?entry.pid, "force-killing agent");
            ids.push(agent_id);
            let mut exit_rx = entry.exit_rx;
            let settle = self.kill_settle;
            waits.push(async move { wait_for_exit(&mut exit_rx, settle).await });
        }
        join_all(waits).await;

        ids.sort_unstable();
        ids
    }

    /// Return the session to idle after a stop, logging the transition.
    async fn mark_stopped(&self, agent_id: u32) -> Result<()> {
        let Some(session) = self.sessions.read(agent_id).await? else {
            return Ok(());
        };
        if session.status == AgentStatus::Idle {
            return Ok(());
        }
        self.sessions
            .update(agent_id, SessionPatch::status(AgentStatus::Idle))
            .await?;
        record_transition(
            &self.transitions,
            agent_id,
            session.status,
            AgentStatus::Idle,
            session.current_work_item,
        );
        Ok(())
    }
}

/// Wait until the exit watcher publishes, or `limit` elapses.
///
/// A closed channel means the watcher is gone and the child was dropped
/// (and killed with it), which counts as exited.
async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitReport>>, limit: Duration) -> bool {
    tokio::time::timeout(limit, async {
        let _ = exit_rx.wait_for(Option::is_some).await;
    })
    .await
    .is_ok()
}
