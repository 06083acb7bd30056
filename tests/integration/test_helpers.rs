//! Shared construction of configuration and orchestrator contexts for
//! integration tests.

use std::future::Future;
use std::time::Duration;

use agent_loop::config::GlobalConfig;
use agent_loop::context::OrchestratorContext;

/// Configuration rooted at `workspace_root` with timings short enough for
/// tests. Agents run `sleep 30`.
pub fn test_config(workspace_root: &std::path::Path) -> GlobalConfig {
    let mut config = GlobalConfig::for_workspace(workspace_root).expect("valid test config");
    config.ipc_name = "agent-loop-test".into();
    config.agent.command = "sleep".into();
    config.agent.args = vec!["30".into()];
    config.supervisor.grace_period_ms = 2_000;
    config.supervisor.kill_settle_ms = 1_000;
    config.heartbeat.interval_ms = 50;
    config.storage.retry_attempts = 0;
    config.storage.retry_base_delay_ms = 0;
    config.storage.restart_delay_ms = 20;
    config
}

/// Build a full orchestrator context over a fresh temporary workspace.
pub async fn test_context(workspace_root: &std::path::Path) -> OrchestratorContext {
    OrchestratorContext::build(test_config(workspace_root))
        .await
        .expect("context builds")
}

/// Poll `check` every 20ms until it returns true or `limit` elapses.
pub async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
