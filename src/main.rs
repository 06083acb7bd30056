#![forbid(unsafe_code)]

//! `agent-loop` orchestrator daemon.
//!
//! Bootstraps configuration, builds the orchestrator context, starts the
//! background sweepers and the IPC server for `agent-loop-ctl`, and stops
//! every agent on shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use agent_loop::config::GlobalConfig;
use agent_loop::context::OrchestratorContext;
use agent_loop::ipc::server;
use agent_loop::orchestrator::snapshot::TracingSink;
use agent_loop::{AppError, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "agent-loop", about = "Agent fleet orchestrator", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the workspace root from the configuration file.
    #[arg(long)]
    workspace: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("agent-loop bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = GlobalConfig::load_from_path(&args.config)?;
    if let Some(ws) = args.workspace {
        config.override_workspace_root(&ws)?;
    }
    info!(workspace = %config.workspace_root.display(), "configuration loaded");

    // ── Build the orchestrator ──────────────────────────
    let ctx = Arc::new(OrchestratorContext::build(config).await?);
    report_leftover_sessions(&ctx).await;

    // ── Start background tasks ──────────────────────────
    let ct = CancellationToken::new();
    let mut handles = ctx.spawn_background(Arc::new(TracingSink), &ct);
    handles.push(server::spawn_ipc_server(Arc::clone(&ctx), ct.clone())?);
    info!("agent-loop ready");

    // ── Wait for shutdown signal ────────────────────────
    shutdown_signal().await;
    info!("shutdown signal received");
    ct.cancel();

    let report = ctx.shutdown().await;
    if report.timed_out {
        warn!(forced = ?report.forced, "some agents had to be force-killed");
    }

    for handle in handles {
        if let Err(err) = handle.await {
            error!(%err, "background task ended abnormally");
        }
    }
    info!(stopped = report.total(), "agent-loop shut down");

    Ok(())
}

/// Log sessions left busy by a previous orchestrator run.
///
/// Process handles are never recovered across restarts, so these agents
/// have no live process; the next start resets them.
async fn report_leftover_sessions(ctx: &OrchestratorContext) {
    use agent_loop::persistence::SessionReader;

    match ctx.sessions.list().await {
        Ok(sessions) => {
            let busy: Vec<u32> = sessions
                .iter()
                .filter(|s| s.status.is_active())
                .map(|s| s.agent_id)
                .collect();
            if busy.is_empty() {
                info!(sessions = sessions.len(), "no busy sessions from a previous run");
            } else {
                warn!(agents = ?busy, "sessions left busy by a previous run");
            }
        }
        Err(err) => error!(%err, "failed to list sessions on startup"),
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
