//! Agent session model and patch helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declared status of an agent.
///
/// There is no terminal state: a stopped agent is `Idle`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Waiting for work.
    Idle,
    /// Executing a claimed work item.
    Working,
    /// Reviewing the result of a work item.
    Reviewing,
    /// Generating new work items.
    Ideating,
    /// Suspended by the operator.
    Paused,
}

impl AgentStatus {
    /// Whether this status means the agent is busy with work.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Working | Self::Reviewing | Self::Ideating)
    }

    /// Lower-case label used in logs and stats.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Reviewing => "reviewing",
            Self::Ideating => "ideating",
            Self::Paused => "paused",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "reviewing" => Ok(Self::Reviewing),
            "ideating" => Ok(Self::Ideating),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown agent status '{other}'")),
        }
    }
}

/// Persistent per-agent state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct AgentSession {
    /// Agent this session belongs to.
    pub agent_id: u32,
    /// Declared status.
    pub status: AgentStatus,
    /// Work item currently being handled.
    pub current_work_item: Option<String>,
    /// Free-form phase label reported by the agent.
    pub current_phase: Option<String>,
    /// Branch the agent is working on.
    pub branch_name: Option<String>,
    /// Liveness timestamp, refreshed by every write.
    pub last_heartbeat: DateTime<Utc>,
    /// Work items completed over the agent's lifetime.
    pub tasks_completed: u64,
    /// Human-readable description of the current task.
    pub current_task_description: Option<String>,
    /// Crashes and errors recorded over the agent's lifetime.
    pub error_count: u64,
    /// Most recent error description.
    pub last_error: Option<String>,
}

impl AgentSession {
    /// Fresh idle session with zeroed counters.
    #[must_use]
    pub fn new(agent_id: u32) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Idle,
            current_work_item: None,
            current_phase: None,
            branch_name: None,
            last_heartbeat: Utc::now(),
            tasks_completed: 0,
            current_task_description: None,
            error_count: 0,
            last_error: None,
        }
    }

    /// Fresh idle start that keeps the lifetime history of `previous`.
    #[must_use]
    pub fn restarted_from(previous: &Self) -> Self {
        Self {
            tasks_completed: previous.tasks_completed,
            error_count: previous.error_count,
            last_error: previous.last_error.clone(),
            branch_name: previous.branch_name.clone(),
            ..Self::new(previous.agent_id)
        }
    }

    /// Milliseconds elapsed since the last heartbeat, clamped at zero.
    #[must_use]
    pub fn heartbeat_age_ms(&self, now: DateTime<Utc>) -> u64 {
        u64::try_from((now - self.last_heartbeat).num_milliseconds()).unwrap_or(0)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &SessionPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(ref value) = patch.current_work_item {
            self.current_work_item.clone_from(value);
        }
        if let Some(ref value) = patch.current_phase {
            self.current_phase.clone_from(value);
        }
        if let Some(ref value) = patch.branch_name {
            self.branch_name.clone_from(value);
        }
        if let Some(ts) = patch.last_heartbeat {
            self.last_heartbeat = ts;
        }
        if let Some(count) = patch.tasks_completed {
            self.tasks_completed = count;
        }
        if let Some(ref value) = patch.current_task_description {
            self.current_task_description.clone_from(value);
        }
        if let Some(count) = patch.error_count {
            self.error_count = count;
        }
        if let Some(ref value) = patch.last_error {
            self.last_error.clone_from(value);
        }
    }
}

/// Partial update for an [`AgentSession`].
///
/// `None` leaves a field untouched; for nullable fields `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionPatch {
    /// New status.
    pub status: Option<AgentStatus>,
    /// New current work item.
    pub current_work_item: Option<Option<String>>,
    /// New phase label.
    pub current_phase: Option<Option<String>>,
    /// New branch name.
    pub branch_name: Option<Option<String>>,
    /// Explicit liveness timestamp; defaults to now on every update.
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// New completed-task counter.
    pub tasks_completed: Option<u64>,
    /// New task description.
    pub current_task_description: Option<Option<String>>,
    /// New error counter.
    pub error_count: Option<u64>,
    /// New last error.
    pub last_error: Option<Option<String>>,
}

impl SessionPatch {
    /// Patch that only changes the status.
    #[must_use]
    pub fn status(status: AgentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Set the current work item.
    #[must_use]
    pub fn with_work_item(mut self, item: Option<String>) -> Self {
        self.current_work_item = Some(item);
        self
    }

    /// Set the task description.
    #[must_use]
    pub fn with_task_description(mut self, description: Option<String>) -> Self {
        self.current_task_description = Some(description);
        self
    }

    /// Set the phase label.
    #[must_use]
    pub fn with_phase(mut self, phase: Option<String>) -> Self {
        self.current_phase = Some(phase);
        self
    }

    /// Set the last error.
    #[must_use]
    pub fn with_last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    /// Set the error counter.
    #[must_use]
    pub fn with_error_count(mut self, count: u64) -> Self {
        self.error_count = Some(count);
        self
    }

    /// Set the completed-task counter.
    #[must_use]
    pub fn with_tasks_completed(mut self, count: u64) -> Self {
        self.tasks_completed = Some(count);
        self
    }

    /// Pin the liveness timestamp instead of using the write time.
    #[must_use]
    pub fn with_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat = Some(at);
        self
    }
}

/// Error count after recording one more crash.
#[must_use]
pub fn next_error_count(previous: u64) -> u64 {
    previous.saturating_add(1)
}
