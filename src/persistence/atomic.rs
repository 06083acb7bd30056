//! Atomic-replace file writes and the transient-failure retry policy.
//!
//! Every record is written to a uniquely named temporary file beside its
//! target and then renamed over it, so a reader never observes a partially
//! written file. Failed writes and deletes are retried with exponential
//! backoff before the last error is surfaced.

use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::{AppError, Result};

/// Exponential backoff applied to storage mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub retries: u32,
    /// Delay before the first retry; doubled for each further retry.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three retries after 1s, 2s and 4s.
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Build the policy from `[storage]` configuration.
    #[must_use]
    pub fn from_config(storage: &StorageConfig) -> Self {
        Self {
            retries: storage.retry_attempts,
            base_delay: Duration::from_millis(storage.retry_base_delay_ms),
        }
    }

    /// Policy without any delay, for tests and tight loops.
    #[must_use]
    pub fn immediate(retries: u32) -> Self {
        Self {
            retries,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Run `op` until it succeeds or the retries are exhausted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` carrying the last failure.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.retries => {
                    let delay = self.delay_for(attempt);
                    warn!(what, attempt = attempt + 1, ?delay, %err, "storage operation failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(AppError::Io(format!(
                        "{what} failed after {} attempt(s): {err}",
                        attempt + 1
                    )));
                }
            }
        }
    }
}

/// Outcome of reading a JSON record from disk.
#[derive(Debug)]
pub enum Loaded<T> {
    /// No file exists at the path.
    Missing,
    /// The file parsed into a valid record.
    Valid(T),
    /// The file exists but is not a valid record.
    Corrupt(String),
}

/// Write `bytes` to `path` through a temporary file and an atomic rename.
///
/// # Errors
///
/// Returns the underlying I/O error from any step.
pub fn write_atomic_blocking(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    debug!(path = %path.display(), "atomic write completed");
    Ok(())
}

/// Async wrapper around [`write_atomic_blocking`].
///
/// # Errors
///
/// Returns the underlying I/O error, or an error if the blocking task panicked.
pub async fn write_atomic(path: PathBuf, bytes: Vec<u8>) -> io::Result<()> {
    tokio::task::spawn_blocking(move || write_atomic_blocking(&path, &bytes))
        .await
        .map_err(|err| io::Error::other(format!("write task failed: {err}")))?
}

/// Remove `path`, treating a missing file as success.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound`.
pub async fn remove_if_exists(path: PathBuf) -> io::Result<()> {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Read and parse a JSON record.
///
/// # Errors
///
/// Returns I/O errors other than `NotFound`; parse failures are reported as
/// [`Loaded::Corrupt`].
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Loaded<T>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(err),
    };
    Ok(match serde_json::from_slice(&raw) {
        Ok(value) => Loaded::Valid(value),
        Err(err) => Loaded::Corrupt(err.to_string()),
    })
}
