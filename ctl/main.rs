#![forbid(unsafe_code)]

//! `agent-loop-ctl`: local CLI companion for the `agent-loop` daemon.
//!
//! Connects to the IPC socket and sends JSON commands to the daemon.
//! Destructive commands ask for confirmation unless `--yes` is passed.

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "agent-loop-ctl",
    about = "Local CLI for the agent-loop daemon",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the daemon's `ipc_name` config).
    #[arg(long, default_value = "agent-loop")]
    ipc_name: String,

    /// Name recorded in the emergency log for this command.
    #[arg(long)]
    actor: Option<String>,

    /// Skip the interactive confirmation for destructive commands.
    #[arg(long, short = 'y', global = true)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Spawn an agent process.
    Start {
        /// Agent id.
        agent_id: u32,
    },
    /// Suspend a running agent.
    Pause {
        /// Agent id.
        agent_id: u32,
    },
    /// Continue a paused agent.
    Resume {
        /// Agent id.
        agent_id: u32,
    },
    /// Stop one agent gracefully.
    Stop {
        /// Agent id.
        agent_id: u32,
    },
    /// Stop every agent and release all claims.
    StopAll {
        /// Seconds to wait before force-killing stragglers.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Stop every agent immediately with the short emergency timeout.
    EmergencyStop,
    /// Stop, clear errors, and start an agent again.
    Restart {
        /// Agent id.
        agent_id: u32,
    },
    /// Release an agent's claims, delete its session, and start it fresh.
    Reset {
        /// Agent id.
        agent_id: u32,
    },
    /// Release claims older than the staleness threshold.
    RecoverClaims,
    /// Release every claim in the ledger.
    PurgeQueue,
    /// List recovery options applicable to the current state.
    Options,
    /// Show loop health, per-agent health, and cycle metrics.
    Health,
    /// Show process and queue statistics.
    Stats,
    /// List active claims.
    Claims,
    /// Claim the next available item for an idle agent.
    Assign {
        /// Agent id.
        agent_id: u32,
        /// Container to draw work from (defaults to the daemon's configured container).
        #[arg(long)]
        container: Option<String>,
    },
    /// Mark an agent's current item complete.
    Complete {
        /// Agent id.
        agent_id: u32,
    },
}

impl Command {
    /// Prompt text for commands that need operator confirmation.
    fn confirmation_prompt(&self) -> Option<String> {
        match self {
            Self::StopAll { .. } => Some("Stop every agent and release all claims?".into()),
            Self::EmergencyStop => Some("Emergency-stop every agent now?".into()),
            Self::Reset { agent_id } => Some(format!(
                "Reset agent {agent_id}? Its session and claims will be discarded."
            )),
            Self::PurgeQueue => Some("Release every claim in the ledger?".into()),
            _ => None,
        }
    }

    fn to_request(&self) -> serde_json::Value {
        match self {
            Self::Start { agent_id } => agent_request("start", *agent_id),
            Self::Pause { agent_id } => agent_request("pause", *agent_id),
            Self::Resume { agent_id } => agent_request("resume", *agent_id),
            Self::Stop { agent_id } => agent_request("stop", *agent_id),
            Self::Restart { agent_id } => agent_request("restart", *agent_id),
            Self::Reset { agent_id } => agent_request("reset", *agent_id),
            Self::Complete { agent_id } => agent_request("complete", *agent_id),
            Self::StopAll { timeout } => {
                let mut req = serde_json::json!({ "command": "stop-all" });
                if let Some(secs) = timeout {
                    req["timeout_seconds"] = serde_json::Value::from(*secs);
                }
                req
            }
            Self::EmergencyStop => serde_json::json!({ "command": "emergency-stop" }),
            Self::RecoverClaims => serde_json::json!({ "command": "recover-claims" }),
            Self::PurgeQueue => serde_json::json!({ "command": "purge-queue" }),
            Self::Options => serde_json::json!({ "command": "options" }),
            Self::Health => serde_json::json!({ "command": "health" }),
            Self::Stats => serde_json::json!({ "command": "stats" }),
            Self::Claims => serde_json::json!({ "command": "claims" }),
            Self::Assign {
                agent_id,
                container,
            } => {
                let mut req = agent_request("assign", *agent_id);
                if let Some(c) = container {
                    req["container"] = serde_json::Value::String(c.clone());
                }
                req
            }
        }
    }
}

fn agent_request(command: &str, agent_id: u32) -> serde_json::Value {
    serde_json::json!({ "command": command, "agent_id": agent_id })
}

fn main() {
    let args = Cli::parse();

    let mut request_json = args.command.to_request();
    if let Some(prompt) = args.command.confirmation_prompt() {
        if !args.yes && !confirm(&prompt) {
            eprintln!("Cancelled.");
            std::process::exit(1);
        }
        request_json["confirm"] = serde_json::Value::Bool(true);
    }
    if let Some(actor) = &args.actor {
        request_json["actor"] = serde_json::Value::String(actor.clone());
    }

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to daemon: {err}");
            eprintln!("Is agent-loop running with ipc_name '{}'?", args.ipc_name);
            std::process::exit(1);
        }
    }
}

/// Ask on stdin; only an explicit `yes` (or `y`) proceeds.
fn confirm(prompt: &str) -> bool {
    eprint!("{prompt} Type 'yes' to continue: ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim().to_ascii_lowercase().as_str(), "yes" | "y")
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
