//! Exit watching and crash classification for agent processes.
//!
//! Every spawned child is owned by one watcher task. The task waits for
//! the process to exit (or force-kills it on request), publishes the exit
//! on a `watch` channel, removes the entry from the tracking table, and
//! decides whether the exit was a crash:
//!
//! - an entry the supervisor flagged as stopping is a normal stop;
//! - otherwise the session status read at exit time decides: any status
//!   other than `idle` is a crash, `idle` is a normal exit.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use super::record_transition;
use super::supervisor::{untrack, TrackedTable};
use crate::models::session::AgentStatus;
use crate::persistence::{SessionReader, SessionStore, TransitionLog};

/// How a process exit was classified.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    /// Exit requested through `stop`.
    Stopped,
    /// Unrequested exit while the agent was idle.
    Exited,
    /// Unrequested exit while the agent was busy or paused.
    Crashed,
}

/// What the OS reported about an exited process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if any (unix only).
    pub signal: Option<i32>,
    /// Human-readable summary.
    pub description: String,
}

impl ExitReport {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        let description = if status.success() {
            "exited normally (code 0)".to_owned()
        } else {
            match (status.code(), signal) {
                (Some(code), _) => format!("exited with code {code}"),
                (None, Some(sig)) => format!("terminated by signal {sig}"),
                (None, None) => "terminated by signal".to_owned(),
            }
        };

        Self {
            code: status.code(),
            signal,
            description,
        }
    }

    fn from_wait_error(err: &std::io::Error) -> Self {
        Self {
            code: None,
            signal: None,
            description: format!("status unknown: {err}"),
        }
    }
}

/// Published after every classified exit.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEvent {
    /// Agent whose process exited.
    pub agent_id: u32,
    /// Classification of the exit.
    pub kind: ExitKind,
    /// OS exit details.
    pub report: ExitReport,
}

/// Everything a watcher task needs; built by the supervisor at spawn time.
pub(crate) struct ExitWatch {
    pub(crate) agent_id: u32,
    pub(crate) generation: u64,
    pub(crate) child: Child,
    pub(crate) kill: Arc<Notify>,
    pub(crate) exit_tx: watch::Sender<Option<ExitReport>>,
    pub(crate) stopping: Arc<AtomicBool>,
    pub(crate) tracked: TrackedTable,
    pub(crate) sessions: Arc<SessionStore>,
    pub(crate) transitions: Arc<TransitionLog>,
    pub(crate) events: broadcast::Sender<ProcessEvent>,
}

/// Spawn the task owning `watch.child` until it exits.
pub(crate) fn spawn_exit_watcher(watch: ExitWatch) -> JoinHandle<()> {
    let span = info_span!("exit_watcher", agent_id = watch.agent_id);
    tokio::spawn(run(watch).instrument(span))
}

async fn run(w: ExitWatch) {
    let ExitWatch {
        agent_id,
        generation,
        mut child,
        kill,
        exit_tx,
        stopping,
        tracked,
        sessions,
        transitions,
        events,
    } = w;

    let report = loop {
        tokio::select! {
            result = child.wait() => {
                break match result {
                    Ok(status) => ExitReport::from_status(status),
                    Err(err) => {
                        warn!(agent_id, %err, "error waiting for agent process");
                        ExitReport::from_wait_error(&err)
                    }
                };
            }
            () = kill.notified() => {
                warn!(agent_id, "force-killing agent process");
                if let Err(err) = child.start_kill() {
                    warn!(agent_id, %err, "failed to force-kill agent process");
                }
            }
        }
    };
    drop(child);

    exit_tx.send_replace(Some(report.clone()));
    untrack(&tracked, agent_id, generation);

    let kind = if stopping.load(Ordering::SeqCst) {
        ExitKind::Stopped
    } else {
        classify_unrequested(agent_id, &sessions, &transitions, &report).await
    };
    info!(
        agent_id,
        ?kind,
        status = %report.description,
        "agent process exited"
    );

    // Nobody listening is fine.
    let _ = events.send(ProcessEvent {
        agent_id,
        kind,
        report,
    });
}

async fn classify_unrequested(
    agent_id: u32,
    sessions: &SessionStore,
    transitions: &TransitionLog,
    report: &ExitReport,
) -> ExitKind {
    let session = match sessions.read(agent_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return ExitKind::Exited,
        Err(err) => {
            warn!(agent_id, %err, "cannot read session to classify exit");
            return ExitKind::Exited;
        }
    };

    if session.status == AgentStatus::Idle {
        return ExitKind::Exited;
    }

    let description = format!(
        "agent process crashed while {}: {}",
        session.status, report.description
    );
    match sessions.record_crash(agent_id, description).await {
        Ok(updated) => {
            warn!(
                agent_id,
                error_count = updated.error_count,
                "agent crash recorded"
            );
        }
        Err(err) => warn!(agent_id, %err, "failed to record agent crash"),
    }
    record_transition(
        transitions,
        agent_id,
        session.status,
        AgentStatus::Idle,
        session.current_work_item,
    );
    ExitKind::Crashed
}
