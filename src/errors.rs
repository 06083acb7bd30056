//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Storage I/O failure, surfaced after retries are exhausted.
    Io(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// A tracked live process already exists for the agent.
    AlreadyRunning(u32),
    /// No tracked process exists for the agent.
    NotRunning(u32),
    /// The agent session is not in the `paused` status.
    NotPaused(u32),
    /// An existing session looks owned by a live agent.
    SessionConflict(String),
    /// The agent's status does not allow the requested work transition.
    InvalidState(String),
    /// The work process could not be spawned.
    Spawn(String),
    /// Signal delivery or process control failure.
    Process(String),
    /// IPC communication failure.
    Ipc(String),
    /// A destructive operation was not confirmed.
    ConfirmationDeclined(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::AlreadyRunning(id) => write!(f, "agent {id} is already running"),
            Self::NotRunning(id) => write!(f, "agent {id} is not running"),
            Self::NotPaused(id) => write!(f, "agent {id} is not paused"),
            Self::SessionConflict(msg) => write!(f, "session conflict: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Ipc(msg) => write!(f, "ipc: {msg}"),
            Self::ConfirmationDeclined(msg) => write!(f, "confirmation declined: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("serialization failed: {err}"))
    }
}
