//! Audit trail for emergency operations.
//!
//! Provides the [`ActionLogger`] trait and associated types. The primary
//! implementation, [`CappedActionLog`], keeps the most recent entries in
//! `.agent-loop/emergency-log.json`.

pub mod writer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Emergency operation recorded in the audit trail.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyAction {
    /// Stop every agent and release every claim.
    StopAll,
    /// Stop, clear errors, and start one agent.
    Restart,
    /// Wipe one agent's state and start it fresh.
    ResetState,
    /// Release claims older than the staleness threshold.
    RecoverStuckClaims,
    /// Remove every claim from the ledger.
    PurgeQueue,
    /// List the recovery options applicable right now.
    RecoveryOptions,
}

/// Outcome of an emergency operation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    /// Completed as requested.
    Success,
    /// Failed or was cancelled.
    Failure,
    /// Completed for some targets only.
    Partial,
}

/// One audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionLogEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Operation performed.
    pub action: EmergencyAction,
    /// Who triggered it (operator name, `sweeper`, ...).
    pub actor: String,
    /// Free-form description of targets and effects.
    pub details: String,
    /// Outcome.
    pub result: ActionResult,
}

impl ActionLogEntry {
    /// Construct an entry stamped with the current time.
    #[must_use]
    pub fn new(
        action: EmergencyAction,
        actor: impl Into<String>,
        result: ActionResult,
        details: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            actor: actor.into(),
            details: details.into(),
            result,
        }
    }
}

/// Writes audit entries to a persistent store.
///
/// Implementations must be [`Send`] and [`Sync`] to allow sharing across
/// async task boundaries via [`std::sync::Arc`].
pub trait ActionLogger: Send + Sync {
    /// Record a single entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying write operation fails.
    fn log_entry(&self, entry: ActionLogEntry) -> crate::Result<()>;

    /// Up to `limit` most recent entries, newest last.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn recent(&self, limit: usize) -> crate::Result<Vec<ActionLogEntry>>;
}

pub use writer::CappedActionLog;
