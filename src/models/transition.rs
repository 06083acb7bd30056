//! State transition log entries and cycle metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::session::AgentStatus;

/// One recorded status change of an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StateTransition {
    /// Agent that changed status.
    pub agent_id: u32,
    /// Status before the change.
    pub from_state: AgentStatus,
    /// Status after the change.
    pub to_state: AgentStatus,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// Work item involved, if any.
    pub work_item_id: Option<String>,
}

impl StateTransition {
    /// Construct a transition stamped with the current time.
    #[must_use]
    pub fn new(
        agent_id: u32,
        from_state: AgentStatus,
        to_state: AgentStatus,
        work_item_id: Option<String>,
    ) -> Self {
        Self {
            agent_id,
            from_state,
            to_state,
            timestamp: Utc::now(),
            work_item_id,
        }
    }
}

/// Cycle statistics for one agent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CycleMetrics {
    /// Completed cycles (pairs of consecutive `working` entries).
    pub cycles_completed: u64,
    /// Duration of the most recent completed cycle in milliseconds.
    pub last_cycle_ms: Option<u64>,
    /// Mean cycle duration in milliseconds.
    pub average_cycle_ms: Option<u64>,
}

/// Compute cycle metrics from an agent's transitions.
///
/// A cycle spans two consecutive transitions into `working`; every other
/// transition is ignored. Entries are sorted by timestamp before use.
#[must_use]
pub fn cycle_metrics<'a>(transitions: impl IntoIterator<Item = &'a StateTransition>) -> CycleMetrics {
    let mut entries: Vec<DateTime<Utc>> = transitions
        .into_iter()
        .filter(|t| t.to_state == AgentStatus::Working)
        .map(|t| t.timestamp)
        .collect();
    entries.sort_unstable();

    let durations: Vec<u64> = entries
        .windows(2)
        .map(|pair| u64::try_from((pair[1] - pair[0]).num_milliseconds()).unwrap_or(0))
        .collect();

    if durations.is_empty() {
        return CycleMetrics::default();
    }

    let total: u64 = durations.iter().sum();
    let count = durations.len() as u64;
    CycleMetrics {
        cycles_completed: count,
        last_cycle_ms: durations.last().copied(),
        average_cycle_ms: Some(total / count),
    }
}
