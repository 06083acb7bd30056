//! Periodic background tasks: stale-claim sweep and health validation.
//!
//! Both run on a fixed interval until the shared cancellation token fires.
//! A failing tick is logged and the next tick runs as usual.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use super::emergency::EmergencyController;
use super::loop_health::StoreHealthValidator;
use super::snapshot::{FleetSnapshot, SnapshotSink};
use crate::persistence::SessionStore;

/// Audit actor recorded for automated claim recovery.
pub const SWEEPER_ACTOR: &str = "sweeper";

/// Spawn the stale-claim sweeper.
///
/// Each tick runs stale-claim recovery through the emergency controller so
/// sweeps that release claims show up in the emergency log.
#[must_use]
pub fn spawn_claim_sweeper(
    emergency: Arc<EmergencyController>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("claim sweeper shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        match emergency.sweep_stale_claims(SWEEPER_ACTOR).await {
                            Ok(released) if !released.is_empty() => {
                                info!(released = released.len(), "stale claims recovered");
                            }
                            Ok(_) => {}
                            Err(err) => error!(%err, "stale claim sweep failed"),
                        }
                    }
                }
            }
        }
        .instrument(info_span!("claim_sweeper")),
    )
}

/// Spawn the health validation task.
///
/// Each tick evaluates overall loop health, logs every recommendation, and
/// publishes a fleet snapshot to `sink`.
#[must_use]
pub fn spawn_health_task(
    sessions: Arc<SessionStore>,
    health: Arc<StoreHealthValidator>,
    sink: Arc<dyn SnapshotSink>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("health task shutting down");
                        break;
                    }
                    _ = interval.tick() => validate(&sessions, &health, sink.as_ref()).await,
                }
            }
        }
        .instrument(info_span!("health_validator")),
    )
}

async fn validate(sessions: &SessionStore, health: &StoreHealthValidator, sink: &dyn SnapshotSink) {
    match health.overall_health().await {
        Ok(report) => {
            for rec in &report.recommendations {
                info!(kind = ?rec.kind, "{}", rec.message);
            }
        }
        Err(err) => error!(%err, "health validation failed"),
    }

    match FleetSnapshot::capture(sessions, health).await {
        Ok(snapshot) => {
            if let Err(err) = sink.publish(&snapshot).await {
                warn!(%err, "snapshot publish failed");
            }
        }
        Err(err) => error!(%err, "snapshot capture failed"),
    }
}
