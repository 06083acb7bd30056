//! Local IPC server for `agent-loop-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! from `agent-loop-ctl` and routes them to the orchestrator context.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "start", "agent_id": 3}
//! {"command": "stop-all", "confirm": true, "timeout_seconds": 20}
//! {"command": "assign", "agent_id": 3, "container": "79"}
//! {"command": "health"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "agent 3 is not running"}
//! ```

use std::sync::Arc;
use std::time::Duration;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::context::OrchestratorContext;
use crate::persistence::SessionReader;
use crate::{AppError, Result};

/// Actor recorded in the emergency log when the request names none.
const DEFAULT_ACTOR: &str = "operator";

/// Inbound IPC request from `agent-loop-ctl`.
#[derive(Debug, Default, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Target agent.
    #[serde(default)]
    pub agent_id: Option<u32>,
    /// Confirmation for destructive commands.
    #[serde(default)]
    pub confirm: bool,
    /// Override of the stop-all timeout.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Container for `assign`.
    #[serde(default)]
    pub container: Option<String>,
    /// Who issued the command.
    #[serde(default)]
    pub actor: Option<String>,
}

/// Outbound IPC response to `agent-loop-ctl`.
#[derive(Debug, Serialize)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result<T: Serialize>(result: Result<T>) -> Self {
        match result.and_then(|value| Ok(serde_json::to_value(value)?)) {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    ctx: Arc<OrchestratorContext>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = ctx.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&ctx)));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    ctx: Arc<OrchestratorContext>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &ctx).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the orchestrator.
pub async fn dispatch_command(request: &IpcRequest, ctx: &OrchestratorContext) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command, agent_id = request.agent_id);
    async {
        let actor = request.actor.as_deref().unwrap_or(DEFAULT_ACTOR);
        match request.command.as_str() {
            "start" => with_agent(request, |id| ctx.fleet.start(id)).await,
            "pause" => with_agent(request, |id| ctx.supervisor.pause(id)).await,
            "resume" => with_agent(request, |id| ctx.supervisor.resume(id)).await,
            "stop" => with_agent(request, |id| ctx.fleet.stop(id)).await,
            "restart" => with_agent(request, |id| ctx.emergency.restart(actor, id)).await,
            "reset" => {
                with_agent(request, |id| {
                    ctx.emergency.reset_state(actor, id, request.confirm)
                })
                .await
            }
            "complete" => with_agent(request, |id| ctx.dispatcher.complete(id)).await,
            "assign" => handle_assign(request, ctx).await,
            "stop-all" => {
                let timeout = request
                    .timeout_seconds
                    .map_or_else(|| ctx.config.stop_all_timeout(), Duration::from_secs);
                IpcResponse::from_result(
                    ctx.emergency
                        .stop_all(actor, request.confirm, timeout)
                        .await,
                )
            }
            "emergency-stop" => IpcResponse::from_result(
                ctx.emergency
                    .stop_all(actor, true, ctx.config.emergency_stop_timeout())
                    .await,
            ),
            "recover-claims" => {
                IpcResponse::from_result(ctx.emergency.recover_stuck_claims(actor).await)
            }
            "purge-queue" => {
                IpcResponse::from_result(ctx.emergency.purge_queue(actor, request.confirm).await)
            }
            "options" => IpcResponse::from_result(ctx.emergency.recovery_options(actor).await),
            "health" => IpcResponse::from_result(handle_health(ctx).await),
            "stats" => IpcResponse::from_result(handle_stats(ctx).await),
            "claims" => IpcResponse::from_result(ctx.queue.list_active().await),
            other => IpcResponse::error(format!("unknown command: {other}")),
        }
    }
    .instrument(span)
    .await
}

/// Run an agent-scoped command, rejecting requests without `agent_id`.
async fn with_agent<T, F, Fut>(request: &IpcRequest, op: F) -> IpcResponse
where
    T: Serialize,
    F: FnOnce(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let Some(agent_id) = request.agent_id else {
        return IpcResponse::error("missing required 'agent_id' field");
    };
    IpcResponse::from_result(op(agent_id).await)
}

async fn handle_assign(request: &IpcRequest, ctx: &OrchestratorContext) -> IpcResponse {
    let Some(agent_id) = request.agent_id else {
        return IpcResponse::error("missing required 'agent_id' field");
    };
    let Some(container) = request
        .container
        .as_deref()
        .or(ctx.config.queue.default_container.as_deref())
    else {
        return IpcResponse::error("missing 'container' and no queue.default_container configured");
    };

    match ctx.dispatcher.assign_next(agent_id, container).await {
        Ok(item) => IpcResponse::success(serde_json::json!({
            "agent_id": agent_id,
            "container": container,
            "assigned": item,
        })),
        Err(err) => IpcResponse::error(err.to_string()),
    }
}

async fn handle_health(ctx: &OrchestratorContext) -> Result<serde_json::Value> {
    let report = ctx.health.overall_health().await?;
    let agents = ctx.heartbeats.health_of_all().await;
    let mut cycles = serde_json::Map::new();
    for session in ctx.sessions.list().await? {
        let metrics = ctx.health.cycle_metrics(session.agent_id)?;
        cycles.insert(session.agent_id.to_string(), serde_json::to_value(metrics)?);
    }
    Ok(serde_json::json!({
        "report": report,
        "agents": agents,
        "cycles": cycles,
    }))
}

async fn handle_stats(ctx: &OrchestratorContext) -> Result<serde_json::Value> {
    let stats = ctx.supervisor.stats().await;
    let queue_depth = ctx.health.queue_depth().await?;
    Ok(serde_json::json!({
        "processes": stats,
        "queue_depth": queue_depth,
        "heartbeats": ctx.heartbeats.beating_agents(),
        "supports_suspend": ctx.supervisor.supports_suspend(),
        "resources": ctx.heartbeats.resources(),
    }))
}
