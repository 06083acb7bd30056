//! Work dispatch: hand the highest-priority claimable item to an agent.
//!
//! Items come from an external [`WorkSource`]; ownership is established
//! only by winning the claim in the [`WorkQueue`]. A paused or busy agent
//! never receives work.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{info, info_span, warn, Instrument};

use super::record_transition;
use crate::models::agent_identity;
use crate::models::session::{AgentSession, AgentStatus, SessionPatch};
use crate::persistence::{SessionReader, SessionStore, TransitionLog, WorkQueue};
use crate::{AppError, Result};

/// A claimable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    /// Identifier within its container.
    pub id: String,
    /// Short description shown as the agent's current task.
    #[serde(default)]
    pub title: Option<String>,
}

impl WorkItem {
    /// Item with no title.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
        }
    }
}

/// Source of claimable work items.
pub trait WorkSource: Send + Sync {
    /// Items available in `container_id`, highest priority first.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    fn list_available<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + 'a>>;
}

/// In-memory [`WorkSource`].
#[derive(Default)]
pub struct StaticWorkSource {
    containers: Mutex<HashMap<String, Vec<WorkItem>>>,
}

impl StaticWorkSource {
    /// Empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Source seeded with `container_id → item ids`.
    #[must_use]
    pub fn from_backlog<'a>(
        backlog: impl IntoIterator<Item = (&'a String, &'a Vec<String>)>,
    ) -> Self {
        let source = Self::new();
        for (container, ids) in backlog {
            source.set_items(container, ids.iter().map(WorkItem::new).collect());
        }
        source
    }

    /// Replace the items of one container.
    pub fn set_items(&self, container_id: &str, items: Vec<WorkItem>) {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(container_id.to_owned(), items);
    }
}

impl WorkSource for StaticWorkSource {
    fn list_available<'a>(
        &'a self,
        container_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<WorkItem>>> + Send + 'a>> {
        let items = self
            .containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container_id)
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(items) })
    }
}

/// Assigns work to agents and records its completion.
pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    queue: Arc<WorkQueue>,
    transitions: Arc<TransitionLog>,
    source: Arc<dyn WorkSource>,
    agent_locks: Mutex<HashMap<u32, Arc<AsyncMutex<()>>>>,
}

impl Dispatcher {
    /// Construct a dispatcher.
    #[must_use]
    pub fn new(
        sessions: Arc<SessionStore>,
        queue: Arc<WorkQueue>,
        transitions: Arc<TransitionLog>,
        source: Arc<dyn WorkSource>,
    ) -> Self {
        Self {
            sessions,
            queue,
            transitions,
            source,
            agent_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the first available item in `container_id` for an idle agent.
    ///
    /// Returns `None` when the agent is not idle or every item is taken.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent has no session, or the
    /// work-source/storage error.
    pub async fn assign_next(&self, agent_id: u32, container_id: &str) -> Result<Option<WorkItem>> {
        let span = info_span!("assign_next", agent_id, container_id);
        async {
            let _guard = self.lock_agent(agent_id).await;
            let session = self.session(agent_id).await?;
            if session.status != AgentStatus::Idle {
                info!(agent_id, status = %session.status, "agent not idle, no work assigned");
                return Ok(None);
            }

            let identity = agent_identity(agent_id);
            for item in self.source.list_available(container_id).await? {
                if !self.queue.claim(container_id, &item.id, &identity).await? {
                    continue;
                }

                let patch = SessionPatch::status(AgentStatus::Working)
                    .with_work_item(Some(item.id.clone()))
                    .with_task_description(item.title.clone())
                    .with_phase(None);
                if let Err(err) = self.sessions.update(agent_id, patch).await {
                    if let Err(release_err) = self.queue.release(container_id, &item.id).await {
                        warn!(agent_id, %release_err, "failed to release claim after session error");
                    }
                    return Err(err);
                }

                record_transition(
                    &self.transitions,
                    agent_id,
                    AgentStatus::Idle,
                    AgentStatus::Working,
                    Some(item.id.clone()),
                );
                info!(agent_id, item_id = %item.id, "work assigned");
                return Ok(Some(item));
            }

            info!(agent_id, "no claimable work available");
            Ok(None)
        }
        .instrument(span)
        .await
    }

    /// Finish the agent's current item: release its claims, count the task,
    /// and return it to idle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the agent has no session or no
    /// current work item, or the storage error.
    pub async fn complete(&self, agent_id: u32) -> Result<AgentSession> {
        async {
            let _guard = self.lock_agent(agent_id).await;
            let session = self.session(agent_id).await?;
            let Some(item) = session.current_work_item.clone() else {
                return Err(AppError::NotFound(format!(
                    "agent {agent_id} has no current work item"
                )));
            };

            let released = self
                .queue
                .release_owned_by(&agent_identity(agent_id))
                .await?;
            let updated = self
                .sessions
                .update(
                    agent_id,
                    SessionPatch::status(AgentStatus::Idle)
                        .with_work_item(None)
                        .with_task_description(None)
                        .with_phase(None)
                        .with_tasks_completed(session.tasks_completed.saturating_add(1)),
                )
                .await?;

            record_transition(
                &self.transitions,
                agent_id,
                session.status,
                AgentStatus::Idle,
                Some(item.clone()),
            );
            info!(
                agent_id,
                item_id = %item,
                released = released.len(),
                tasks_completed = updated.tasks_completed,
                "work completed"
            );
            Ok(updated)
        }
        .instrument(info_span!("complete_work", agent_id))
        .await
    }

    /// Move a busy agent to another working phase.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless both the current and the
    /// requested status are working, reviewing, or ideating.
    pub async fn set_phase(&self, agent_id: u32, status: AgentStatus) -> Result<AgentSession> {
        let _guard = self.lock_agent(agent_id).await;
        let session = self.session(agent_id).await?;
        if !status.is_active() {
            return Err(AppError::InvalidState(format!(
                "{status} is not a working phase"
            )));
        }
        if !session.status.is_active() {
            return Err(AppError::InvalidState(format!(
                "agent {agent_id} is {} and holds no work",
                session.status
            )));
        }

        let updated = self
            .sessions
            .update(agent_id, SessionPatch::status(status))
            .await?;
        record_transition(
            &self.transitions,
            agent_id,
            session.status,
            status,
            session.current_work_item,
        );
        info!(agent_id, from = %session.status, to = %status, "phase changed");
        Ok(updated)
    }

    /// Serializes check-claim-update sequences for one agent.
    async fn lock_agent(&self, agent_id: u32) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .agent_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(agent_id).or_default())
        };
        lock.lock_owned().await
    }

    async fn session(&self, agent_id: u32) -> Result<AgentSession> {
        self.sessions
            .read(agent_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("session for agent {agent_id}")))
    }
}
