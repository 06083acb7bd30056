//! Process supervision against real `sleep` processes.
#![cfg(unix)]

use std::time::Duration;

use agent_loop::models::session::{AgentStatus, SessionPatch};
use agent_loop::orchestrator::supervisor::StopOutcome;
use agent_loop::persistence::SessionReader;
use agent_loop::AppError;

use super::test_helpers::{eventually, test_context};

#[tokio::test]
async fn start_tracks_process_and_creates_idle_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let session = ctx.supervisor.start(1).await.expect("start");

    assert_eq!(session.status, AgentStatus::Idle);
    assert!(ctx.supervisor.is_running(1));
    let stats = ctx.supervisor.stats().await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.by_status.get("idle"), Some(&1));
    assert!(stats.per_agent[&1].pid.is_some());

    ctx.supervisor.stop(1).await.expect("stop");
}

#[tokio::test]
async fn second_start_is_already_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.supervisor.start(2).await.expect("start");

    let again = ctx.supervisor.start(2).await;
    assert!(matches!(again, Err(AppError::AlreadyRunning(2))));

    ctx.supervisor.stop(2).await.expect("stop");
}

#[tokio::test]
async fn spawn_failure_is_recorded_on_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = super::test_helpers::test_config(temp.path());
    config.agent.command = "/definitely/not/a/binary".into();
    let ctx = agent_loop::context::OrchestratorContext::build(config)
        .await
        .expect("context");

    let result = ctx.supervisor.start(3).await;
    assert!(matches!(result, Err(AppError::Spawn(_))));
    assert!(!ctx.supervisor.is_running(3));

    let session = ctx.sessions.read(3).await.expect("read").expect("session");
    assert_eq!(session.error_count, 1);
    assert!(session.last_error.is_some());
}

#[tokio::test]
async fn pause_then_resume_returns_to_idle() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.supervisor.start(4).await.expect("start");
    ctx.sessions
        .update(4, SessionPatch::status(AgentStatus::Working))
        .await
        .expect("working");

    let paused = ctx.supervisor.pause(4).await.expect("pause");
    assert_eq!(paused.status, AgentStatus::Paused);
    assert!(ctx.supervisor.is_running(4), "suspended process stays tracked");

    let resumed = ctx.supervisor.resume(4).await.expect("resume");
    assert_eq!(resumed.status, AgentStatus::Idle);

    let log = ctx.transitions.for_agent(4).expect("log");
    let pairs: Vec<(AgentStatus, AgentStatus)> =
        log.iter().map(|t| (t.from_state, t.to_state)).collect();
    assert!(pairs.contains(&(AgentStatus::Working, AgentStatus::Paused)));
    assert!(pairs.contains(&(AgentStatus::Paused, AgentStatus::Idle)));

    ctx.supervisor.stop(4).await.expect("stop");
}

#[tokio::test]
async fn pause_of_untracked_agent_is_not_running() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let result = ctx.supervisor.pause(5).await;
    assert!(matches!(result, Err(AppError::NotRunning(5))));
}

#[tokio::test]
async fn resume_of_unpaused_agent_is_not_paused() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.supervisor.start(6).await.expect("start");

    let result = ctx.supervisor.resume(6).await;
    assert!(matches!(result, Err(AppError::NotPaused(6))));

    ctx.supervisor.stop(6).await.expect("stop");
}

#[tokio::test]
async fn stop_terminates_gracefully_and_idles_the_session() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.supervisor.start(7).await.expect("start");
    ctx.sessions
        .update(7, SessionPatch::status(AgentStatus::Working))
        .await
        .expect("working");

    let outcome = ctx.supervisor.stop(7).await.expect("stop");

    assert_eq!(outcome, StopOutcome::Exited);
    assert!(!ctx.supervisor.is_running(7));
    let session = ctx.sessions.read(7).await.expect("read").expect("session");
    assert_eq!(session.status, AgentStatus::Idle);
    assert_eq!(session.error_count, 0, "requested stop is not a crash");
}

#[tokio::test]
async fn stopping_a_paused_agent_still_terminates_it() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    ctx.supervisor.start(8).await.expect("start");
    ctx.supervisor.pause(8).await.expect("pause");

    let outcome = ctx.supervisor.stop(8).await.expect("stop");

    assert_eq!(outcome, StopOutcome::Exited);
    let session = ctx.sessions.read(8).await.expect("read").expect("session");
    assert_eq!(session.status, AgentStatus::Idle);
}

#[tokio::test]
async fn stop_of_untracked_agent_is_a_no_op() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let outcome = ctx.supervisor.stop(9).await.expect("stop");
    assert_eq!(outcome, StopOutcome::NotTracked);
}

#[tokio::test]
async fn stop_all_converges_to_an_empty_table() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    for id in 1..=3 {
        ctx.supervisor.start(id).await.expect("start");
    }

    let report = ctx.supervisor.stop_all(Duration::from_secs(10)).await;

    assert!(!report.timed_out);
    assert_eq!(report.total(), 3);
    assert!(ctx.supervisor.tracked_agents().is_empty());
}

#[tokio::test]
async fn stop_all_force_kills_processes_ignoring_terminate() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = super::test_helpers::test_config(temp.path());
    config.agent.command = "sh".into();
    config.agent.args = vec!["-c".into(), "trap '' TERM; sleep 30".into()];
    config.supervisor.grace_period_ms = 5_000;
    config.supervisor.kill_settle_ms = 2_000;
    let ctx = agent_loop::context::OrchestratorContext::build(config)
        .await
        .expect("context");
    ctx.supervisor.start(1).await.expect("start");
    ctx.supervisor.start(2).await.expect("start");
    // Give the shells time to install their traps.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let report = ctx.supervisor.stop_all(Duration::from_millis(300)).await;

    assert!(report.timed_out);
    assert_eq!(report.forced, vec![1, 2]);
    assert!(ctx.supervisor.tracked_agents().is_empty());
    for id in [1, 2] {
        let session = ctx.sessions.read(id).await.expect("read").expect("session");
        assert_eq!(session.status, AgentStatus::Idle);
    }
}

#[tokio::test]
async fn self_exiting_idle_agent_is_untracked_without_error() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = super::test_helpers::test_config(temp.path());
    config.agent.command = "true".into();
    config.agent.args = Vec::new();
    let ctx = agent_loop::context::OrchestratorContext::build(config)
        .await
        .expect("context");

    ctx.supervisor.start(1).await.expect("start");

    let gone = eventually(Duration::from_secs(5), || async {
        !ctx.supervisor.is_running(1)
    })
    .await;
    assert!(gone, "exited process must be untracked");
    let session = ctx.sessions.read(1).await.expect("read").expect("session");
    assert_eq!(session.error_count, 0);
}
