//! Shared ledger of active work claims.
//!
//! The ledger is a single JSON array (`claims.json`). Every read-check-write
//! sequence runs under an in-process mutex and an exclusive `fs2` lock on
//! `claims.lock`, so two agents racing for the same item (even from
//! different processes) see exactly one winner.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, Instrument};

use super::atomic::{self, Loaded, RetryPolicy};
use crate::models::claim::WorkClaim;
use crate::{AppError, Result};

const LEDGER_FILE: &str = "claims.json";
const LOCK_FILE: &str = "claims.lock";

/// Read-only view of the claim ledger.
pub trait ClaimReader: Send + Sync {
    /// Every active claim.
    fn list_active(&self) -> impl Future<Output = Result<Vec<WorkClaim>>> + Send;
}

/// Exclusive lock on the ledger lock file; released on drop.
struct LedgerLock(File);

impl Drop for LedgerLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.0) {
            debug!(%err, "failed to release claim ledger lock");
        }
    }
}

/// Atomic claim/release of work items across agents.
pub struct WorkQueue {
    ledger_path: PathBuf,
    lock_path: PathBuf,
    retry: RetryPolicy,
    writer: Mutex<()>,
}

impl WorkQueue {
    /// Open the ledger stored in `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub async fn open(state_dir: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let state_dir = state_dir.into();
        tokio::fs::create_dir_all(&state_dir).await?;
        Ok(Self {
            ledger_path: state_dir.join(LEDGER_FILE),
            lock_path: state_dir.join(LOCK_FILE),
            retry,
            writer: Mutex::new(()),
        })
    }

    /// Try to take ownership of `(container_id, item_id)` for `agent_identity`.
    ///
    /// Returns `true` iff this call established the claim; `false` means
    /// another claim already covers the item.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be locked or written.
    pub async fn claim(
        &self,
        container_id: &str,
        item_id: &str,
        agent_identity: &str,
    ) -> Result<bool> {
        let claim = WorkClaim::new(container_id, item_id, agent_identity);
        let span = info_span!("claim", container_id, item_id, agent = agent_identity);
        let won = self
            .mutate(move |claims| {
                if claims
                    .iter()
                    .any(|c| c.covers(&claim.container_id, &claim.work_item_id))
                {
                    return (false, false);
                }
                claims.push(claim);
                (true, true)
            })
            .instrument(span)
            .await?;

        if won {
            info!(container_id, item_id, agent = agent_identity, "work item claimed");
        } else {
            debug!(container_id, item_id, agent = agent_identity, "work item already claimed");
        }
        Ok(won)
    }

    /// Release the claim on `(container_id, item_id)`, returning it if one existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be locked or written.
    pub async fn release(&self, container_id: &str, item_id: &str) -> Result<Option<WorkClaim>> {
        let (container, item) = (container_id.to_owned(), item_id.to_owned());
        let released = self
            .release_where(move |c| c.covers(&container, &item))
            .await?;
        Ok(released.into_iter().next())
    }

    /// Every active claim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be read.
    pub async fn list_active(&self) -> Result<Vec<WorkClaim>> {
        self.load().await
    }

    /// Claims held by `agent_identity`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be read.
    pub async fn list_by_owner(&self, agent_identity: &str) -> Result<Vec<WorkClaim>> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .filter(|c| c.claimed_by == agent_identity)
            .collect())
    }

    /// Release every claim held by `agent_identity`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be locked or written.
    pub async fn release_owned_by(&self, agent_identity: &str) -> Result<Vec<WorkClaim>> {
        let owner = agent_identity.to_owned();
        self.release_where(move |c| c.claimed_by == owner).await
    }

    /// Release every claim held for at least `threshold` at `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be locked or written.
    pub async fn release_stale(
        &self,
        now: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> Result<Vec<WorkClaim>> {
        self.release_where(move |c| c.is_stale(now, threshold)).await
    }

    /// Remove every claim, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the ledger cannot be locked or written.
    pub async fn clear_all(&self) -> Result<usize> {
        let cleared = self.release_where(|_| true).await?.len();
        info!(cleared, "claim ledger cleared");
        Ok(cleared)
    }

    async fn release_where<P>(&self, predicate: P) -> Result<Vec<WorkClaim>>
    where
        P: Fn(&WorkClaim) -> bool + Send,
    {
        let released = self
            .mutate(move |claims| {
                let (released, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(claims).into_iter().partition(|c| predicate(c));
                *claims = kept;
                let changed = !released.is_empty();
                (released, changed)
            })
            .await?;
        for claim in &released {
            info!(
                container_id = %claim.container_id,
                item_id = %claim.work_item_id,
                owner = %claim.claimed_by,
                "claim released"
            );
        }
        Ok(released)
    }

    /// Run a read-check-write step under full mutual exclusion.
    ///
    /// `step` returns its result and whether the ledger changed.
    async fn mutate<T, F>(&self, step: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<WorkClaim>) -> (T, bool) + Send,
    {
        let _writer = self.writer.lock().await;
        let _lock = self.lock_ledger().await?;

        let mut claims = self.load().await?;
        let (out, changed) = step(&mut claims);
        if changed {
            let bytes = serde_json::to_vec_pretty(&claims)?;
            let path = self.ledger_path.clone();
            self.retry
                .run("write claim ledger", || {
                    atomic::write_atomic(path.clone(), bytes.clone())
                })
                .await?;
        }
        Ok(out)
    }

    async fn lock_ledger(&self) -> Result<LedgerLock> {
        let path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(LedgerLock(file))
        })
        .await
        .map_err(|err| AppError::Io(format!("ledger lock task failed: {err}")))?
        .map_err(|err| AppError::Io(format!("failed to lock claim ledger: {err}")))
    }

    async fn load(&self) -> Result<Vec<WorkClaim>> {
        let path = self.ledger_path.clone();
        let loaded = self
            .retry
            .run("read claim ledger", || atomic::read_json::<Vec<WorkClaim>>(&path))
            .await?;
        Ok(match loaded {
            Loaded::Missing => Vec::new(),
            Loaded::Valid(claims) => claims,
            Loaded::Corrupt(reason) => {
                error!(reason, "claim ledger unreadable, starting from an empty ledger");
                Vec::new()
            }
        })
    }
}

impl ClaimReader for WorkQueue {
    async fn list_active(&self) -> Result<Vec<WorkClaim>> {
        WorkQueue::list_active(self).await
    }
}
