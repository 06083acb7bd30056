//! IPC command routing, plus one round trip over a real local socket.

use std::sync::Arc;

use agent_loop::ipc::server::{dispatch_command, spawn_ipc_server, IpcRequest};
use agent_loop::models::session::AgentStatus;
use agent_loop::persistence::SessionReader;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{test_config, test_context};

fn request(command: &str) -> IpcRequest {
    IpcRequest {
        command: command.into(),
        ..IpcRequest::default()
    }
}

fn agent_request(command: &str, agent_id: u32) -> IpcRequest {
    IpcRequest {
        agent_id: Some(agent_id),
        ..request(command)
    }
}

#[tokio::test]
async fn unknown_command_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let response = dispatch_command(&request("dance"), &ctx).await;

    assert!(!response.ok);
    assert_eq!(response.error.as_deref(), Some("unknown command: dance"));
}

#[tokio::test]
async fn agent_commands_require_agent_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    for command in ["start", "pause", "resume", "stop", "restart", "reset", "complete", "assign"] {
        let response = dispatch_command(&request(command), &ctx).await;
        assert!(!response.ok, "{command}");
        assert!(
            response
                .error
                .as_deref()
                .is_some_and(|e| e.contains("agent_id")),
            "{command}"
        );
    }
}

#[tokio::test]
async fn health_and_stats_report_on_an_empty_fleet() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let health = dispatch_command(&request("health"), &ctx).await;
    assert!(health.ok);
    let data = health.data.expect("data");
    assert_eq!(data["report"]["healthy"], true);
    assert_eq!(data["report"]["queue_depth"]["active"], 0);

    let stats = dispatch_command(&request("stats"), &ctx).await;
    assert!(stats.ok);
    assert_eq!(stats.data.expect("data")["processes"]["count"], 0);
}

#[tokio::test]
async fn assign_and_complete_flow_through_ipc() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    config.queue.default_container = Some("79".into());
    config
        .queue
        .backlog
        .insert("79".into(), vec!["123".into(), "124".into()]);
    let ctx = agent_loop::context::OrchestratorContext::build(config)
        .await
        .expect("context");
    ctx.sessions.create(1).await.expect("create");

    let assigned = dispatch_command(&agent_request("assign", 1), &ctx).await;
    assert!(assigned.ok, "{:?}", assigned.error);
    let data = assigned.data.expect("data");
    assert_eq!(data["container"], "79");
    assert_eq!(data["assigned"]["id"], "123");

    let claims = dispatch_command(&request("claims"), &ctx).await;
    assert_eq!(claims.data.expect("data").as_array().map(Vec::len), Some(1));

    let completed = dispatch_command(&agent_request("complete", 1), &ctx).await;
    assert!(completed.ok, "{:?}", completed.error);
    let session = ctx.sessions.read(1).await.expect("read").expect("session");
    assert_eq!(session.status, AgentStatus::Idle);
    assert_eq!(session.tasks_completed, 1);
}

#[tokio::test]
async fn assign_without_container_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let response = dispatch_command(&agent_request("assign", 1), &ctx).await;
    assert!(!response.ok);
    assert!(response
        .error
        .as_deref()
        .is_some_and(|e| e.contains("container")));
}

#[tokio::test]
async fn destructive_commands_need_confirm() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let declined = dispatch_command(&request("purge-queue"), &ctx).await;
    assert!(!declined.ok);
    assert!(declined
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("confirmation declined")));

    let confirmed = dispatch_command(
        &IpcRequest {
            confirm: true,
            actor: Some("alice".into()),
            ..request("purge-queue")
        },
        &ctx,
    )
    .await;
    assert!(confirmed.ok);
    assert_eq!(confirmed.data.expect("data"), 0);

    use agent_loop::audit::ActionLogger;
    let log = ctx.audit.recent(1).expect("audit");
    assert_eq!(log[0].actor, "alice");
}

#[cfg(unix)]
#[tokio::test]
async fn lifecycle_commands_drive_the_supervisor() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;

    let started = dispatch_command(&agent_request("start", 2), &ctx).await;
    assert!(started.ok, "{:?}", started.error);
    assert!(ctx.supervisor.is_running(2));

    let paused = dispatch_command(&agent_request("pause", 2), &ctx).await;
    assert_eq!(paused.data.expect("data")["status"], "paused");

    let resumed = dispatch_command(&agent_request("resume", 2), &ctx).await;
    assert_eq!(resumed.data.expect("data")["status"], "idle");

    let stopped = dispatch_command(&agent_request("stop", 2), &ctx).await;
    assert_eq!(stopped.data.expect("data"), "exited");
    assert!(!ctx.supervisor.is_running(2));

    let again = dispatch_command(&agent_request("resume", 2), &ctx).await;
    assert_eq!(again.error.as_deref(), Some("agent 2 is not paused"));
}

#[cfg(unix)]
#[tokio::test]
async fn emergency_stop_needs_no_confirmation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let ctx = test_context(temp.path()).await;
    dispatch_command(&agent_request("start", 1), &ctx).await;

    let response = dispatch_command(&request("emergency-stop"), &ctx).await;

    assert!(response.ok, "{:?}", response.error);
    assert_eq!(response.data.expect("data")["agents_stopped"], 1);
    assert!(ctx.supervisor.tracked_agents().is_empty());
}

#[tokio::test]
async fn server_answers_over_local_socket() {
    use std::io::{BufRead, BufReader, Write};

    use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path());
    let name = format!("agent-loop-test-{}", std::process::id());
    config.ipc_name.clone_from(&name);
    let ctx = Arc::new(
        agent_loop::context::OrchestratorContext::build(config)
            .await
            .expect("context"),
    );
    let ct = CancellationToken::new();
    let server = spawn_ipc_server(Arc::clone(&ctx), ct.clone()).expect("server starts");

    let response = tokio::task::spawn_blocking(move || {
        let ns_name = name.to_ns_name::<GenericNamespaced>().expect("name");
        let mut stream = Stream::connect(ns_name).expect("connect");
        stream
            .write_all(b"{\"command\":\"claims\"}\n")
            .expect("write");
        stream.flush().expect("flush");
        let mut line = String::new();
        BufReader::new(&stream).read_line(&mut line).expect("read");
        serde_json::from_str::<serde_json::Value>(line.trim()).expect("json")
    })
    .await
    .expect("client task");

    assert_eq!(response["ok"], true);
    assert_eq!(response["data"], serde_json::json!([]));

    ct.cancel();
    server.await.expect("server stops");
}
