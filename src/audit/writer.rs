//! Size-capped JSON audit log with atomic replacement.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::warn;

use super::{ActionLogEntry, ActionLogger};
use crate::persistence::atomic::write_atomic_blocking;
use crate::{AppError, Result};

const LOG_FILE: &str = "emergency-log.json";

/// Keeps the `cap` most recent entries in `<state_dir>/emergency-log.json`.
///
/// Each append is a read-modify-write of the whole array under a mutex,
/// finished by an atomic rename, so entries are never interleaved or torn.
pub struct CappedActionLog {
    path: PathBuf,
    cap: usize,
    guard: Mutex<()>,
}

impl CappedActionLog {
    /// Construct a log stored in `state_dir`.
    ///
    /// Creates `state_dir` and all parent directories if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(state_dir: &Path, cap: usize) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create audit directory {}: {e}",
                state_dir.display()
            ))
        })?;
        Ok(Self {
            path: state_dir.join(LOG_FILE),
            cap: cap.max(1),
            guard: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<ActionLogEntry>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&raw) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                warn!("emergency log unreadable, starting a new one: {e}");
                Ok(Vec::new())
            }
        }
    }
}

impl ActionLogger for CappedActionLog {
    fn log_entry(&self, entry: ActionLogEntry) -> Result<()> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| AppError::Io("emergency log mutex poisoned".to_string()))?;

        let mut entries = self.load()?;
        entries.push(entry);
        if entries.len() > self.cap {
            let excess = entries.len() - self.cap;
            entries.drain(..excess);
        }

        let bytes = serde_json::to_vec_pretty(&entries)?;
        write_atomic_blocking(&self.path, &bytes).map_err(|e| {
            warn!("failed to write emergency log entry: {e}");
            AppError::Io(format!("emergency log write failed: {e}"))
        })
    }

    fn recent(&self, limit: usize) -> Result<Vec<ActionLogEntry>> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| AppError::Io("emergency log mutex poisoned".to_string()))?;
        let entries = self.load()?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.into_iter().skip(skip).collect())
    }
}
