//! OS signal delivery to agent processes.
//!
//! Unix platforms use `nix` to deliver `SIGTERM`, `SIGSTOP`, and `SIGCONT`.
//! Forced kills always go through the child handle in the exit watcher, so
//! they work on every platform; [`SUPPORTS_SUSPEND`] advertises the rest.

use crate::{AppError, Result};

/// Whether this platform can suspend and resume a process.
pub const SUPPORTS_SUSPEND: bool = cfg!(unix);

/// Whether this platform has a graceful-termination signal.
pub const SUPPORTS_GRACEFUL_TERMINATE: bool = cfg!(unix);

/// Signals the supervisor sends to agent processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Ask the process to exit.
    Terminate,
    /// Suspend execution.
    Suspend,
    /// Resume a suspended process.
    Continue,
}

/// Deliver `signal` to `pid`.
///
/// # Errors
///
/// Returns `AppError::Process` if delivery fails or the platform lacks the signal.
#[cfg(unix)]
pub fn send(pid: u32, signal: ProcessSignal) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|&p| p > 0)
        .ok_or_else(|| AppError::Process(format!("invalid pid {pid}")))?;
    let sig = match signal {
        ProcessSignal::Terminate => Signal::SIGTERM,
        ProcessSignal::Suspend => Signal::SIGSTOP,
        ProcessSignal::Continue => Signal::SIGCONT,
    };
    kill(Pid::from_raw(raw), sig)
        .map_err(|err| AppError::Process(format!("failed to send {sig:?} to pid {pid}: {err}")))
}

/// Deliver `signal` to `pid`.
///
/// # Errors
///
/// Always returns `AppError::Process`: this platform has no signal delivery.
#[cfg(not(unix))]
pub fn send(pid: u32, signal: ProcessSignal) -> Result<()> {
    Err(AppError::Process(format!(
        "{signal:?} is not supported on this platform (pid {pid})"
    )))
}
