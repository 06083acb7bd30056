//! Per-agent heartbeat timers and liveness classification.
//!
//! Each started agent gets one background task that refreshes the
//! session's liveness timestamp on a fixed interval. Starting an agent that
//! already beats cancels the old timer first, so there is never more than
//! one timer per agent. Emission failures are logged and the timer keeps
//! going; a missed beat simply ages the session toward `degraded`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::health::HealthStatus;
use crate::models::session::SessionPatch;
use crate::persistence::{SessionReader, SessionStore};

/// Resource usage of the orchestrator process at one heartbeat.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ResourceSample {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU usage in percent since the previous sample.
    pub cpu_percent: f32,
}

/// Samples the orchestrator's own process through `sysinfo`.
struct ResourceProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ResourceProbe {
    fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(err) => {
                warn!(err, "resource diagnostics unavailable");
                None
            }
        };
        Self {
            system: Mutex::new(System::new()),
            pid,
        }
    }

    fn sample(&self) -> Option<ResourceSample> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|process| ResourceSample {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

struct Beat {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Drives heartbeats for every started agent.
pub struct HeartbeatMonitor {
    sessions: Arc<SessionStore>,
    interval: Duration,
    probe: Arc<ResourceProbe>,
    beats: Mutex<HashMap<u32, Beat>>,
}

impl HeartbeatMonitor {
    /// Construct a monitor emitting one heartbeat per `interval`.
    #[must_use]
    pub fn new(sessions: Arc<SessionStore>, interval: Duration) -> Self {
        Self {
            sessions,
            interval,
            probe: Arc::new(ResourceProbe::new()),
            beats: Mutex::new(HashMap::new()),
        }
    }

    fn beats(&self) -> MutexGuard<'_, HashMap<u32, Beat>> {
        self.beats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit one heartbeat now, then keep beating until [`Self::stop`].
    ///
    /// A timer already running for `agent_id` is cancelled first.
    pub async fn start(&self, agent_id: u32) {
        self.stop(agent_id);
        emit(&self.sessions, &self.probe, agent_id).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            run(
                agent_id,
                self.interval,
                Arc::clone(&self.sessions),
                Arc::clone(&self.probe),
                cancel.clone(),
            )
            .instrument(info_span!("heartbeat", agent_id)),
        );

        if let Some(previous) = self.beats().insert(agent_id, Beat { cancel, task }) {
            // Lost a race with a concurrent start for the same agent.
            previous.cancel.cancel();
        }
        info!(agent_id, interval_ms = self.interval.as_millis(), "heartbeat started");
    }

    /// Cancel the agent's timer. Returns whether one was running.
    pub fn stop(&self, agent_id: u32) -> bool {
        let Some(beat) = self.beats().remove(&agent_id) else {
            return false;
        };
        beat.cancel.cancel();
        debug!(agent_id, "heartbeat stopped");
        true
    }

    /// Cancel every timer.
    pub fn stop_all(&self) {
        let drained: Vec<(u32, Beat)> = self.beats().drain().collect();
        for (_, beat) in &drained {
            beat.cancel.cancel();
        }
        if !drained.is_empty() {
            info!(count = drained.len(), "all heartbeats stopped");
        }
    }

    /// Whether a timer is running for `agent_id`.
    #[must_use]
    pub fn is_beating(&self, agent_id: u32) -> bool {
        self.beats()
            .get(&agent_id)
            .is_some_and(|beat| !beat.task.is_finished())
    }

    /// Ids of agents with a running timer, ascending.
    #[must_use]
    pub fn beating_agents(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.beats().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Classify one agent. Storage errors read as unresponsive.
    pub async fn health_of(&self, agent_id: u32) -> HealthStatus {
        self.sessions.health_of(agent_id).await.unwrap_or_else(|err| {
            warn!(agent_id, %err, "cannot read session for health check");
            HealthStatus::Unresponsive
        })
    }

    /// Classify every agent that has a session.
    pub async fn health_of_all(&self) -> BTreeMap<u32, HealthStatus> {
        let now = chrono::Utc::now();
        match self.sessions.list().await {
            Ok(sessions) => sessions
                .iter()
                .map(|s| (s.agent_id, HealthStatus::from_age_ms(s.heartbeat_age_ms(now))))
                .collect(),
            Err(err) => {
                warn!(%err, "cannot list sessions for health check");
                BTreeMap::new()
            }
        }
    }

    /// Current resource usage of the orchestrator process.
    #[must_use]
    pub fn resources(&self) -> Option<ResourceSample> {
        self.probe.sample()
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        for beat in self.beats().values() {
            beat.cancel.cancel();
        }
    }
}

async fn run(
    agent_id: u32,
    period: Duration,
    sessions: Arc<SessionStore>,
    probe: Arc<ResourceProbe>,
    cancel: CancellationToken,
) {
    // The immediate beat was emitted by `start`.
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!(agent_id, "heartbeat task cancelled");
                break;
            }
            _ = ticker.tick() => emit(&sessions, &probe, agent_id).await,
        }
    }
}

/// Refresh the liveness timestamp. Never fails the caller.
async fn emit(sessions: &SessionStore, probe: &ResourceProbe, agent_id: u32) {
    match sessions.update(agent_id, SessionPatch::default()).await {
        Ok(session) => {
            match probe.sample() {
                Some(sample) => debug!(
                    agent_id,
                    status = %session.status,
                    memory_bytes = sample.memory_bytes,
                    cpu_percent = f64::from(sample.cpu_percent),
                    "heartbeat"
                ),
                None => debug!(agent_id, status = %session.status, "heartbeat"),
            }
        }
        Err(err) => warn!(agent_id, %err, "heartbeat write failed"),
    }
}
