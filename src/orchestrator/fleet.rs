//! Process supervision and heartbeats driven together.
//!
//! An agent that is started through the [`Fleet`] also starts beating; a
//! stop cancels the timer before the process is signalled. Unrequested
//! exits reported by the supervisor stop the timer too, so a dead agent
//! ages toward `unresponsive` instead of looking alive.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::child_monitor::ExitKind;
use super::heartbeat::HeartbeatMonitor;
use super::supervisor::{ProcessSupervisor, StopAllReport, StopOutcome};
use crate::models::session::AgentSession;
use crate::Result;

/// Supervisor plus heartbeat monitor.
pub struct Fleet {
    supervisor: Arc<ProcessSupervisor>,
    heartbeats: Arc<HeartbeatMonitor>,
}

impl Fleet {
    /// Pair a supervisor with a heartbeat monitor.
    #[must_use]
    pub fn new(supervisor: Arc<ProcessSupervisor>, heartbeats: Arc<HeartbeatMonitor>) -> Self {
        Self {
            supervisor,
            heartbeats,
        }
    }

    /// The process supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    /// The heartbeat monitor.
    #[must_use]
    pub fn heartbeats(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeats
    }

    /// Start the process, then its heartbeat.
    ///
    /// # Errors
    ///
    /// Propagates [`ProcessSupervisor::start`] errors; no timer is started.
    pub async fn start(&self, agent_id: u32) -> Result<AgentSession> {
        let session = self.supervisor.start(agent_id).await?;
        self.heartbeats.start(agent_id).await;
        Ok(session)
    }

    /// Stop the heartbeat, then the process.
    ///
    /// # Errors
    ///
    /// Propagates [`ProcessSupervisor::stop`] errors.
    pub async fn stop(&self, agent_id: u32) -> Result<StopOutcome> {
        self.heartbeats.stop(agent_id);
        self.supervisor.stop(agent_id).await
    }

    /// Stop every heartbeat, then every process within `timeout`.
    pub async fn stop_all(&self, timeout: Duration) -> StopAllReport {
        self.heartbeats.stop_all();
        self.supervisor.stop_all(timeout).await
    }

    /// Stop heartbeats of agents whose process went away on its own.
    #[must_use]
    pub fn spawn_exit_listener(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut events = self.supervisor.subscribe();
        let fleet = Arc::clone(self);
        tokio::spawn(
            async move {
                loop {
                    let event = tokio::select! {
                        () = cancel.cancelled() => break,
                        event = events.recv() => event,
                    };
                    match event {
                        Ok(event) if event.kind == ExitKind::Stopped => {}
                        Ok(event) => {
                            // A restart may already have a new process beating.
                            if !fleet.supervisor.is_running(event.agent_id)
                                && fleet.heartbeats.stop(event.agent_id)
                            {
                                info!(
                                    agent_id = event.agent_id,
                                    kind = ?event.kind,
                                    "heartbeat stopped after process exit"
                                );
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "exit listener lagged, reconciling heartbeats");
                            for agent_id in fleet.heartbeats.beating_agents() {
                                if !fleet.supervisor.is_running(agent_id) {
                                    fleet.heartbeats.stop(agent_id);
                                }
                            }
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                debug!("exit listener stopped");
            }
            .instrument(info_span!("exit_listener")),
        )
    }
}
