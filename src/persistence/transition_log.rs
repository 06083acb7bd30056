//! Append-only JSONL log of agent state transitions.

use std::{
    fs::{self, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::warn;

use crate::models::transition::StateTransition;
use crate::{AppError, Result};

const LOG_FILE: &str = "transitions.jsonl";

/// Appends one JSON object per line to `<state_dir>/transitions.jsonl`.
///
/// The log feeds derived metrics only; it is never authoritative for an
/// agent's current status.
pub struct TransitionLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<fs::File>>>,
}

impl TransitionLog {
    /// Construct a log stored in `state_dir`, creating the directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create state directory {}: {e}",
                state_dir.display()
            ))
        })?;
        Ok(Self {
            path: state_dir.join(LOG_FILE),
            writer: Mutex::new(None),
        })
    }

    /// Append one transition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the entry cannot be written or flushed.
    pub fn append(&self, transition: &StateTransition) -> Result<()> {
        let line = serde_json::to_string(transition)?;

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| AppError::Io("transition log mutex poisoned".to_string()))?;

        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .map_err(|e| {
                    AppError::Io(format!(
                        "failed to open transition log {}: {e}",
                        self.path.display()
                    ))
                })?;
            *guard = Some(BufWriter::new(file));
        }

        let written = match guard.as_mut() {
            Some(writer) => writeln!(writer, "{line}").and_then(|()| writer.flush()),
            None => Ok(()),
        };
        if let Err(e) = written {
            // Reopen on the next append.
            *guard = None;
            return Err(AppError::Io(format!("transition write failed: {e}")));
        }
        Ok(())
    }

    /// Every transition recorded for `agent_id`, in file order.
    ///
    /// Malformed lines are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log exists but cannot be read.
    pub fn for_agent(&self, agent_id: u32) -> Result<Vec<StateTransition>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|t| t.agent_id == agent_id)
            .collect())
    }

    /// Every recorded transition, in file order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the log exists but cannot be read.
    pub fn read_all(&self) -> Result<Vec<StateTransition>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StateTransition>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = index + 1, "skipping malformed transition entry: {e}"),
            }
        }
        Ok(entries)
    }
}
