//! Durable, corruption-tolerant per-agent session files.
//!
//! Each agent owns `sessions/agent-<id>.json`. Writes go through
//! [`super::atomic`] and are serialized per agent so concurrent merges do
//! not interleave. A file that fails to parse or validate is replaced by a
//! fresh idle record on the read path; corruption never surfaces as an error.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, info_span, warn, Instrument};

use super::atomic::{self, Loaded, RetryPolicy};
use crate::models::health::{HealthStatus, DEGRADED_AFTER_MS};
use crate::models::session::{next_error_count, AgentSession, AgentStatus, SessionPatch};
use crate::{AppError, Result};

const FILE_PREFIX: &str = "agent-";
const FILE_SUFFIX: &str = ".json";

/// Read-only view of agent sessions.
pub trait SessionReader: Send + Sync {
    /// Read one session, or `None` if the agent has none.
    fn read(&self, agent_id: u32) -> impl Future<Output = Result<Option<AgentSession>>> + Send;

    /// Read every stored session, ordered by agent id.
    fn list(&self) -> impl Future<Output = Result<Vec<AgentSession>>> + Send;
}

/// File-backed store of [`AgentSession`] records.
pub struct SessionStore {
    dir: PathBuf,
    retry: RetryPolicy,
    locks: Mutex<HashMap<u32, Arc<AsyncMutex<()>>>>,
}

impl SessionStore {
    /// Open (and create if needed) the session directory.
    ///
    /// Leftover temporary files from interrupted writes are removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|err| {
            AppError::Io(format!(
                "failed to create session directory {}: {err}",
                dir.display()
            ))
        })?;
        remove_interrupted_writes(&dir).await;
        Ok(Self {
            dir,
            retry,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding the session files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the session file for `agent_id`.
    #[must_use]
    pub fn path_for(&self, agent_id: u32) -> PathBuf {
        self.dir.join(format!("{FILE_PREFIX}{agent_id}{FILE_SUFFIX}"))
    }

    /// Create the session for an agent that is about to start.
    ///
    /// A prior valid record keeps its lifetime counters; status and work
    /// fields are reset to a fresh idle start.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionConflict` if the prior record reports an
    /// active status with a healthy heartbeat, or `AppError::Io` on storage
    /// failure.
    pub async fn create(&self, agent_id: u32) -> Result<AgentSession> {
        let _guard = self.lock(agent_id).await;

        let session = match self.load(agent_id).await? {
            Some(previous) => {
                let age = previous.heartbeat_age_ms(Utc::now());
                if previous.status.is_active() && age < DEGRADED_AFTER_MS {
                    return Err(AppError::SessionConflict(format!(
                        "agent {agent_id} is {} with a heartbeat {age}ms old",
                        previous.status
                    )));
                }
                AgentSession::restarted_from(&previous)
            }
            None => AgentSession::new(agent_id),
        };

        self.persist(&session).await?;
        info!(agent_id, "session created");
        Ok(session)
    }

    /// Merge `patch` into the stored session.
    ///
    /// The liveness timestamp is always refreshed unless the patch pins it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent has no session, or
    /// `AppError::Io` on storage failure.
    pub async fn update(&self, agent_id: u32, patch: SessionPatch) -> Result<AgentSession> {
        self.update_with(agent_id, move |session| session.apply(&patch))
            .await
    }

    /// Record one crash: increment the error count by exactly one, store the
    /// description, and return the agent to idle.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`].
    pub async fn record_crash(&self, agent_id: u32, description: String) -> Result<AgentSession> {
        self.update_with(agent_id, move |session| {
            session.error_count = next_error_count(session.error_count);
            session.last_error = Some(description);
            session.status = AgentStatus::Idle;
        })
        .await
    }

    /// Record a non-crash error (e.g. spawn failure) without touching status.
    ///
    /// # Errors
    ///
    /// Same as [`Self::update`].
    pub async fn record_error(&self, agent_id: u32, description: String) -> Result<AgentSession> {
        self.update_with(agent_id, move |session| {
            session.error_count = next_error_count(session.error_count);
            session.last_error = Some(description);
        })
        .await
    }

    /// Remove the agent's session file. Missing files are not an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the delete keeps failing after retries.
    pub async fn delete(&self, agent_id: u32) -> Result<()> {
        let _guard = self.lock(agent_id).await;
        let path = self.path_for(agent_id);
        self.retry
            .run("delete session", || atomic::remove_if_exists(path.clone()))
            .await?;
        info!(agent_id, "session deleted");
        Ok(())
    }

    /// Classify an agent's liveness; no session means unresponsive.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` on storage failure.
    pub async fn health_of(&self, agent_id: u32) -> Result<HealthStatus> {
        Ok(match SessionReader::read(self, agent_id).await? {
            Some(session) => HealthStatus::from_age_ms(session.heartbeat_age_ms(Utc::now())),
            None => HealthStatus::Unresponsive,
        })
    }

    async fn update_with<F>(&self, agent_id: u32, mutate: F) -> Result<AgentSession>
    where
        F: FnOnce(&mut AgentSession) + Send,
    {
        let span = info_span!("session_update", agent_id);
        async move {
            let _guard = self.lock(agent_id).await;
            let mut session = self
                .load(agent_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("session for agent {agent_id}")))?;

            // Any successful write counts as activity; a patch may still pin it.
            session.last_heartbeat = Utc::now();
            mutate(&mut session);
            session.agent_id = agent_id;

            self.persist(&session).await?;
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Load a session, healing corrupt files. Caller must hold the agent lock.
    async fn load(&self, agent_id: u32) -> Result<Option<AgentSession>> {
        let path = self.path_for(agent_id);
        let loaded = self
            .retry
            .run("read session", || atomic::read_json::<AgentSession>(&path))
            .await?;

        match loaded {
            Loaded::Missing => Ok(None),
            Loaded::Valid(session) if session.agent_id == agent_id => Ok(Some(session)),
            Loaded::Valid(session) => {
                self.heal(
                    agent_id,
                    &format!("record belongs to agent {}", session.agent_id),
                )
                .await
                .map(Some)
            }
            Loaded::Corrupt(reason) => self.heal(agent_id, &reason).await.map(Some),
        }
    }

    async fn heal(&self, agent_id: u32, reason: &str) -> Result<AgentSession> {
        warn!(agent_id, reason, "session file invalid, replacing with a fresh record");
        let fresh = AgentSession::new(agent_id);
        self.persist(&fresh).await?;
        Ok(fresh)
    }

    async fn persist(&self, session: &AgentSession) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        let path = self.path_for(session.agent_id);
        self.retry
            .run("write session", || atomic::write_atomic(path.clone(), bytes.clone()))
            .await
    }

    async fn lock(&self, agent_id: u32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            Arc::clone(locks.entry(agent_id).or_default())
        };
        lock.lock_owned().await
    }
}

impl SessionReader for SessionStore {
    async fn read(&self, agent_id: u32) -> Result<Option<AgentSession>> {
        let _guard = self.lock(agent_id).await;
        self.load(agent_id).await
    }

    async fn list(&self) -> Result<Vec<AgentSession>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = agent_id_from_file_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();

        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = SessionReader::read(self, id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }
}

/// Parse `agent-<id>.json` into the agent id.
fn agent_id_from_file_name(name: &str) -> Option<u32> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse()
        .ok()
}

async fn remove_interrupted_writes(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(".tmp") {
            debug!(path = %entry.path().display(), "removing interrupted write");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}
