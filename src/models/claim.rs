//! Work claim model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive ownership of one work item by one agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct WorkClaim {
    /// Claimed work item.
    pub work_item_id: String,
    /// Parent collection of the work item.
    pub container_id: String,
    /// Identity of the claiming agent (e.g. `agent-3`).
    pub claimed_by: String,
    /// When the claim was established.
    pub claimed_at: DateTime<Utc>,
}

impl WorkClaim {
    /// Construct a claim stamped with the current time.
    #[must_use]
    pub fn new(container_id: &str, work_item_id: &str, claimed_by: &str) -> Self {
        Self {
            work_item_id: work_item_id.to_owned(),
            container_id: container_id.to_owned(),
            claimed_by: claimed_by.to_owned(),
            claimed_at: Utc::now(),
        }
    }

    /// Whether this claim covers `(container_id, work_item_id)`.
    #[must_use]
    pub fn covers(&self, container_id: &str, work_item_id: &str) -> bool {
        self.container_id == container_id && self.work_item_id == work_item_id
    }

    /// Whether the claim has been held for at least `threshold` at `now`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.claimed_at >= threshold
    }
}
