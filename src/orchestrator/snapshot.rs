//! Fleet snapshots pushed to a dashboard sink.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::loop_health::{QueueDepth, StoreHealthValidator};
use crate::models::health::HealthStatus;
use crate::models::session::AgentSession;
use crate::persistence::SessionReader;
use crate::Result;

/// Point-in-time view of every agent.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FleetSnapshot {
    /// Every stored session, by agent id.
    pub sessions: Vec<AgentSession>,
    /// Health classification per agent.
    pub health: BTreeMap<u32, HealthStatus>,
    /// Queue pressure.
    pub queue_depth: QueueDepth,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}

impl FleetSnapshot {
    /// Read sessions and claims and classify every agent.
    ///
    /// # Errors
    ///
    /// Returns the storage error if sessions or claims cannot be read.
    pub async fn capture(
        sessions: &impl SessionReader,
        health: &StoreHealthValidator,
    ) -> Result<Self> {
        let taken_at = Utc::now();
        let sessions = sessions.list().await?;
        let classified = sessions
            .iter()
            .map(|s| {
                (
                    s.agent_id,
                    HealthStatus::from_age_ms(s.heartbeat_age_ms(taken_at)),
                )
            })
            .collect();
        Ok(Self {
            sessions,
            health: classified,
            queue_depth: health.queue_depth().await?,
            taken_at,
        })
    }
}

/// Receives periodic fleet snapshots.
pub trait SnapshotSink: Send + Sync {
    /// Accept one snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if delivery fails; the publisher logs and continues.
    fn publish<'a>(
        &'a self,
        snapshot: &'a FleetSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Sink that writes a one-line summary to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl SnapshotSink for TracingSink {
    fn publish<'a>(
        &'a self,
        snapshot: &'a FleetSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let healthy = snapshot
                .health
                .values()
                .filter(|h| **h == HealthStatus::Healthy)
                .count();
            info!(
                agents = snapshot.sessions.len(),
                healthy,
                active_claims = snapshot.queue_depth.active,
                reviewable = snapshot.queue_depth.reviewable,
                "fleet snapshot"
            );
            Ok(())
        })
    }
}
