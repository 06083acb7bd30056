//! Agent process spawner.
//!
//! Spawns the work process for an agent. Each agent gets its own child
//! process with `kill_on_drop(true)` for safety. The `AGENT_LOOP_*`
//! environment variables tell the payload which agent it is and where its
//! session record lives.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::info;

use crate::config::AgentConfig;
use crate::models::agent_identity;
use crate::{AppError, Result};

/// Environment variable carrying the numeric agent id.
pub const ENV_AGENT_ID: &str = "AGENT_LOOP_AGENT_ID";
/// Environment variable carrying the claim identity (`agent-<id>`).
pub const ENV_AGENT_IDENTITY: &str = "AGENT_LOOP_IDENTITY";
/// Environment variable carrying the path of the agent's session file.
pub const ENV_SESSION_FILE: &str = "AGENT_LOOP_SESSION_FILE";

/// Spawn the work process for `agent_id`.
///
/// # Errors
///
/// Returns `AppError::Spawn` if the process fails to start.
pub fn spawn_agent_process(
    agent: &AgentConfig,
    workspace_root: &Path,
    agent_id: u32,
    session_file: &Path,
) -> Result<Child> {
    let mut cmd = Command::new(&agent.command);
    cmd.args(&agent.args)
        .env(ENV_AGENT_ID, agent_id.to_string())
        .env(ENV_AGENT_IDENTITY, agent_identity(agent_id))
        .env(ENV_SESSION_FILE, session_file)
        .current_dir(workspace_root)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        AppError::Spawn(format!(
            "failed to spawn '{}' for agent {agent_id}: {err}",
            agent.command
        ))
    })?;

    info!(
        agent_id,
        pid = child.id().unwrap_or(0),
        command = agent.command,
        "agent process spawned"
    );
    Ok(child)
}
