//! Orchestrator context: every component, built once and shared.
//!
//! The daemon constructs one [`OrchestratorContext`] at startup and hands
//! it to the IPC server; nothing is reachable through global state.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::audit::{ActionLogger, CappedActionLog};
use crate::config::GlobalConfig;
use crate::orchestrator::background::{spawn_claim_sweeper, spawn_health_task};
use crate::orchestrator::dispatch::{Dispatcher, StaticWorkSource, WorkSource};
use crate::orchestrator::emergency::{EmergencyController, EmergencyPolicy};
use crate::orchestrator::fleet::Fleet;
use crate::orchestrator::heartbeat::HeartbeatMonitor;
use crate::orchestrator::loop_health::{HealthThresholds, StoreHealthValidator};
use crate::orchestrator::snapshot::SnapshotSink;
use crate::orchestrator::supervisor::{ProcessSupervisor, StopAllReport};
use crate::persistence::{RetryPolicy, SessionStore, TransitionLog, WorkQueue};
use crate::Result;

const SESSIONS_DIR: &str = "sessions";

/// Shared handles to every orchestration component.
pub struct OrchestratorContext {
    /// Validated configuration.
    pub config: Arc<GlobalConfig>,
    /// Per-agent session records.
    pub sessions: Arc<SessionStore>,
    /// Claim ledger.
    pub queue: Arc<WorkQueue>,
    /// State transition log.
    pub transitions: Arc<TransitionLog>,
    /// Process supervisor.
    pub supervisor: Arc<ProcessSupervisor>,
    /// Heartbeat timers.
    pub heartbeats: Arc<HeartbeatMonitor>,
    /// Supervisor and heartbeats driven together.
    pub fleet: Arc<Fleet>,
    /// Loop health validator.
    pub health: Arc<StoreHealthValidator>,
    /// Emergency operations.
    pub emergency: Arc<EmergencyController>,
    /// Work dispatch.
    pub dispatcher: Arc<Dispatcher>,
    /// Emergency action log.
    pub audit: Arc<CappedActionLog>,
}

impl OrchestratorContext {
    /// Build every component, drawing work from the configured backlog.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the state directory cannot be prepared.
    pub async fn build(config: GlobalConfig) -> Result<Self> {
        let source = Arc::new(StaticWorkSource::from_backlog(&config.queue.backlog));
        Self::build_with_source(config, source).await
    }

    /// Build every component around an external work source.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the state directory cannot be prepared.
    pub async fn build_with_source(
        config: GlobalConfig,
        source: Arc<dyn WorkSource>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let state_dir = config.state_dir();
        let retry = RetryPolicy::from_config(&config.storage);

        let sessions =
            Arc::new(SessionStore::open(state_dir.join(SESSIONS_DIR), retry).await?);
        let queue = Arc::new(WorkQueue::open(&state_dir, retry).await?);
        let transitions = Arc::new(TransitionLog::new(&state_dir)?);
        let audit = Arc::new(CappedActionLog::new(
            &state_dir,
            config.storage.emergency_log_cap,
        )?);

        let supervisor = Arc::new(ProcessSupervisor::new(
            &config,
            Arc::clone(&sessions),
            Arc::clone(&transitions),
        ));
        let heartbeats = Arc::new(HeartbeatMonitor::new(
            Arc::clone(&sessions),
            config.heartbeat_interval(),
        ));
        let fleet = Arc::new(Fleet::new(Arc::clone(&supervisor), Arc::clone(&heartbeats)));
        let health = Arc::new(StoreHealthValidator::new(
            Arc::clone(&sessions),
            Arc::clone(&queue),
            Arc::clone(&transitions),
            HealthThresholds::from(&config.health),
        ));
        let emergency = Arc::new(EmergencyController::new(
            Arc::clone(&fleet),
            Arc::clone(&sessions),
            Arc::clone(&queue),
            Arc::clone(&health),
            Arc::clone(&audit) as Arc<dyn ActionLogger>,
            EmergencyPolicy {
                skip_confirmation: config.skip_confirmation,
                restart_delay: config.restart_delay(),
                stale_claim_after: config.stale_claim_after(),
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&queue),
            Arc::clone(&transitions),
            source,
        ));

        info!(state_dir = %state_dir.display(), "orchestrator context ready");
        Ok(Self {
            config,
            sessions,
            queue,
            transitions,
            supervisor,
            heartbeats,
            fleet,
            health,
            emergency,
            dispatcher,
            audit,
        })
    }

    /// Spawn the exit listener, stale-claim sweeper, and health task.
    #[must_use]
    pub fn spawn_background(
        &self,
        sink: Arc<dyn SnapshotSink>,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.fleet.spawn_exit_listener(cancel.clone()),
            spawn_claim_sweeper(
                Arc::clone(&self.emergency),
                self.config.sweep_interval(),
                cancel.clone(),
            ),
            spawn_health_task(
                Arc::clone(&self.sessions),
                Arc::clone(&self.health),
                sink,
                self.config.validation_interval(),
                cancel.clone(),
            ),
        ]
    }

    /// Stop every heartbeat and every agent within the configured timeout.
    pub async fn shutdown(&self) -> StopAllReport {
        self.fleet.stop_all(self.config.stop_all_timeout()).await
    }
}
