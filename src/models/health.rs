//! Heartbeat-derived health classification.

use serde::{Deserialize, Serialize};

/// Heartbeat age at which an agent stops being healthy.
pub const DEGRADED_AFTER_MS: u64 = 60_000;

/// Heartbeat age at which an agent is considered unresponsive.
pub const UNRESPONSIVE_AFTER_MS: u64 = 120_000;

/// Heartbeat age after which an agent is reported stuck.
pub const STUCK_AFTER_MS: u64 = 30 * 60 * 1_000;

/// Liveness classification of an agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Heartbeat younger than one minute.
    Healthy,
    /// Heartbeat between one and two minutes old.
    Degraded,
    /// Heartbeat at least two minutes old, or no session at all.
    Unresponsive,
}

impl HealthStatus {
    /// Classify a heartbeat age using half-open intervals.
    #[must_use]
    pub fn from_age_ms(age_ms: u64) -> Self {
        if age_ms < DEGRADED_AFTER_MS {
            Self::Healthy
        } else if age_ms < UNRESPONSIVE_AFTER_MS {
            Self::Degraded
        } else {
            Self::Unresponsive
        }
    }
}
