//! Domain model module declarations.

pub mod claim;
pub mod health;
pub mod session;
pub mod transition;

/// Identity string under which an agent holds work claims.
#[must_use]
pub fn agent_identity(agent_id: u32) -> String {
    format!("agent-{agent_id}")
}
