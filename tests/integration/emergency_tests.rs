//! Emergency operations and their audit trail.

use std::time::Duration;

use agent_loop::audit::{ActionLogger, ActionResult, EmergencyAction};
use agent_loop::models::session::{AgentStatus, SessionPatch};
use agent_loop::persistence::SessionReader;
use agent_loop::AppError;
use chrono::Utc;

use super::test_helpers::test_context;

#[tokio::test]
async fn unconfirmed_purge_is_declined_and_logged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.queue.claim("79", "123", "agent-1").await.expect("claim");

    let result = ctx.emergency.purge_queue("operator", false).await;

    assert!(matches!(result, Err(AppError::ConfirmationDeclined(_))));
    assert_eq!(ctx.queue.list_active().await.expect("claims").len(), 1);

    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, EmergencyAction::PurgeQueue);
    assert_eq!(log[0].result, ActionResult::Failure);
    assert!(log[0].details.starts_with("cancelled"));
}

#[tokio::test]
async fn confirmed_purge_clears_ledger() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.queue.claim("79", "1", "agent-1").await.expect("claim");
    ctx.queue.claim("79", "2", "agent-2").await.expect("claim");

    let cleared = ctx.emergency.purge_queue("operator", true).await.expect("purge");

    assert_eq!(cleared, 2);
    assert!(ctx.queue.list_active().await.expect("claims").is_empty());
    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, ActionResult::Success);
}

#[tokio::test]
async fn skip_confirmation_treats_calls_as_confirmed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = super::test_helpers::test_config(temp.path());
    config.skip_confirmation = true;
    let ctx = agent_loop::context::OrchestratorContext::build(config)
        .await
        .expect("context");
    ctx.queue.claim("79", "1", "agent-1").await.expect("claim");

    let cleared = ctx.emergency.purge_queue("automation", false).await.expect("purge");
    assert_eq!(cleared, 1);
}

#[tokio::test]
async fn recover_releases_only_stale_claims() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.queue.claim("79", "new", "agent-1").await.expect("claim");

    // A claim taken nine hours ago, written straight into the ledger.
    let ledger = temp.path().canonicalize().expect("canonical").join(".agent-loop/claims.json");
    let mut claims: Vec<serde_json::Value> =
        serde_json::from_slice(&std::fs::read(&ledger).expect("read ledger")).expect("json");
    claims.push(serde_json::json!({
        "work_item_id": "old",
        "container_id": "79",
        "claimed_by": "agent-2",
        "claimed_at": (Utc::now() - chrono::Duration::hours(9)).to_rfc3339(),
    }));
    std::fs::write(&ledger, serde_json::to_vec(&claims).expect("json")).expect("write ledger");

    let released = ctx
        .emergency
        .recover_stuck_claims("operator")
        .await
        .expect("recover");

    assert_eq!(released.len(), 1);
    assert_eq!(released[0].work_item_id, "old");
    let remaining = ctx.queue.list_active().await.expect("claims");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].work_item_id, "new");

    let log = ctx.audit.recent(1).expect("audit");
    assert_eq!(log[0].action, EmergencyAction::RecoverStuckClaims);
    assert!(log[0].details.contains("79/old"));
}

#[tokio::test]
async fn idle_sweep_leaves_no_audit_entry() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.queue.claim("79", "fresh", "agent-1").await.expect("claim");

    for _ in 0..3 {
        let released = ctx.emergency.sweep_stale_claims("sweeper").await.expect("sweep");
        assert!(released.is_empty());
    }
    assert!(ctx.audit.recent(10).expect("audit").is_empty());

    // An operator asking explicitly still gets a record.
    ctx.emergency
        .recover_stuck_claims("operator")
        .await
        .expect("recover");
    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].actor, "operator");
    assert_eq!(log[0].details, "no stale claims");
}

#[tokio::test]
async fn recovery_options_reflect_state() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let idle = ctx.emergency.recovery_options("operator").await.expect("options");
    assert_eq!(idle.len(), 5);
    assert!(idle.iter().all(|o| !o.applicable));

    ctx.queue.claim("79", "1", "agent-1").await.expect("claim");
    let options = ctx.emergency.recovery_options("operator").await.expect("options");
    let purge = options.iter().find(|o| o.id == "purge-queue").expect("purge option");
    assert!(purge.applicable);
    assert!(purge.destructive);

    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|e| e.action == EmergencyAction::RecoveryOptions));
}

#[tokio::test]
async fn stuck_agent_makes_restart_applicable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.sessions.create(4).await.expect("create");
    ctx.sessions
        .update(
            4,
            SessionPatch::status(AgentStatus::Working)
                .with_heartbeat(Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .expect("stale");

    let options = ctx.emergency.recovery_options("operator").await.expect("options");
    let restart = options.iter().find(|o| o.id == "restart").expect("restart option");
    assert!(restart.applicable);
}

#[cfg(unix)]
#[tokio::test]
async fn stop_all_stops_agents_and_releases_claims() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.fleet.start(1).await.expect("start");
    ctx.fleet.start(2).await.expect("start");
    ctx.queue.claim("79", "1", "agent-1").await.expect("claim");

    let summary = ctx
        .emergency
        .stop_all("operator", true, Duration::from_secs(10))
        .await
        .expect("stop all");

    assert_eq!(summary.agents_stopped, 2);
    assert_eq!(summary.claims_released, 1);
    assert!(summary.forced.is_empty());
    assert!(ctx.supervisor.tracked_agents().is_empty());
    assert!(ctx.heartbeats.beating_agents().is_empty());

    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, EmergencyAction::StopAll);
    assert_eq!(log[0].result, ActionResult::Success);
}

#[cfg(unix)]
#[tokio::test]
async fn unconfirmed_stop_all_leaves_agents_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.fleet.start(1).await.expect("start");

    let result = ctx
        .emergency
        .stop_all("operator", false, Duration::from_secs(10))
        .await;

    assert!(matches!(result, Err(AppError::ConfirmationDeclined(_))));
    assert!(ctx.supervisor.is_running(1));
    ctx.fleet.stop(1).await.expect("cleanup");
}

#[cfg(unix)]
#[tokio::test]
async fn restart_clears_errors_and_keeps_history() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.fleet.start(3).await.expect("start");
    ctx.sessions
        .update(
            3,
            SessionPatch::default()
                .with_error_count(4)
                .with_last_error(Some("boom".into()))
                .with_tasks_completed(6),
        )
        .await
        .expect("seed history");

    let session = ctx.emergency.restart("operator", 3).await.expect("restart");

    assert_eq!(session.status, AgentStatus::Idle);
    assert_eq!(session.error_count, 0);
    assert_eq!(session.last_error, None);
    assert_eq!(session.tasks_completed, 6);
    assert!(ctx.supervisor.is_running(3));
    assert!(ctx.heartbeats.is_beating(3));

    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].action, EmergencyAction::Restart);

    ctx.fleet.stop(3).await.expect("cleanup");
}

#[cfg(unix)]
#[tokio::test]
async fn restart_of_stopped_agent_starts_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let session = ctx.emergency.restart("operator", 8).await.expect("restart");

    assert_eq!(session.agent_id, 8);
    assert!(ctx.supervisor.is_running(8));
    ctx.fleet.stop(8).await.expect("cleanup");
}

#[cfg(unix)]
#[tokio::test]
async fn restart_recovers_untracked_busy_agent() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.sessions.create(4).await.expect("create");
    ctx.sessions
        .update(
            4,
            SessionPatch::status(AgentStatus::Working)
                .with_work_item(Some("123".into()))
                .with_error_count(2)
                .with_heartbeat(Utc::now() - chrono::Duration::hours(1)),
        )
        .await
        .expect("left busy");
    let stuck = ctx.health.detect_stuck().await.expect("stuck");
    assert_eq!(stuck.len(), 1);
    assert!(!ctx.supervisor.is_running(4));

    let session = ctx.emergency.restart("operator", 4).await.expect("restart");

    assert_eq!(session.status, AgentStatus::Idle);
    assert_eq!(session.current_work_item, None);
    assert_eq!(session.error_count, 0);
    assert!(ctx.supervisor.is_running(4));
    assert!(ctx.health.detect_stuck().await.expect("stuck").is_empty());

    let log = ctx.audit.recent(10).expect("audit");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].result, ActionResult::Success);

    ctx.fleet.stop(4).await.expect("cleanup");
}

#[cfg(unix)]
#[tokio::test]
async fn reset_wipes_session_and_releases_claims() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.fleet.start(5).await.expect("start");
    ctx.queue.claim("79", "123", "agent-5").await.expect("claim");
    ctx.queue.claim("79", "200", "agent-6").await.expect("claim");
    ctx.sessions
        .update(
            5,
            SessionPatch::status(AgentStatus::Working)
                .with_work_item(Some("123".into()))
                .with_tasks_completed(3)
                .with_error_count(2),
        )
        .await
        .expect("busy");

    let summary = ctx
        .emergency
        .reset_state("operator", 5, true)
        .await
        .expect("reset");

    assert_eq!(summary.claims_released, 1);
    assert_eq!(summary.session.tasks_completed, 0);
    assert_eq!(summary.session.error_count, 0);
    assert_eq!(summary.session.current_work_item, None);
    assert!(ctx.supervisor.is_running(5));

    let remaining = ctx.queue.list_active().await.expect("claims");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].claimed_by, "agent-6");

    let stored = ctx.sessions.read(5).await.expect("read").expect("session");
    assert_eq!(stored.tasks_completed, 0);

    ctx.fleet.stop(5).await.expect("cleanup");
}

#[tokio::test]
async fn unconfirmed_reset_changes_nothing() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.sessions.create(5).await.expect("create");
    ctx.queue.claim("79", "123", "agent-5").await.expect("claim");

    let result = ctx.emergency.reset_state("operator", 5, false).await;

    assert!(matches!(result, Err(AppError::ConfirmationDeclined(_))));
    assert_eq!(ctx.queue.list_active().await.expect("claims").len(), 1);
    assert!(ctx.sessions.read(5).await.expect("read").is_some());
}
