//! Agent orchestration: process supervision, heartbeats, loop health,
//! work dispatch, and emergency recovery.

pub mod background;
pub mod child_monitor;
pub mod dispatch;
pub mod emergency;
pub mod fleet;
pub mod heartbeat;
pub mod loop_health;
pub mod signals;
pub mod snapshot;
pub mod spawner;
pub mod supervisor;

use tracing::warn;

use crate::models::session::AgentStatus;
use crate::models::transition::StateTransition;
use crate::persistence::TransitionLog;

/// Append a status change to the transition log; same-status moves are
/// skipped. Failures are logged, never propagated.
pub(crate) fn record_transition(
    log: &TransitionLog,
    agent_id: u32,
    from: AgentStatus,
    to: AgentStatus,
    work_item_id: Option<String>,
) {
    if from == to {
        return;
    }
    if let Err(err) = log.append(&StateTransition::new(agent_id, from, to, work_item_id)) {
        warn!(agent_id, %err, "failed to record state transition");
    }
}
