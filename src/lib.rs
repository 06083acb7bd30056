#![forbid(unsafe_code)]

//! `agent-loop`: control plane for a fleet of autonomous worker agents.
//!
//! Agents claim work from a shared ledger, run as supervised child
//! processes, heartbeat into per-agent session files, and are recovered
//! after crashes, stalls, or operator intervention.

pub mod audit;
pub mod config;
pub mod context;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod persistence;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
