//! Global configuration parsing and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Name of the state directory created under the workspace root.
pub const STATE_DIR_NAME: &str = ".agent-loop";

/// Upper bound for hour-scale thresholds (ten years).
const MAX_THRESHOLD_HOURS: u64 = 87_600;

/// Placeholder work process launched for every agent.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AgentConfig {
    /// Binary to execute for each agent (e.g. `sleep`, a wrapper script).
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Arguments passed to the command.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

fn default_agent_command() -> String {
    "sleep".into()
}

fn default_agent_args() -> Vec<String> {
    vec!["86400".into()]
}

/// Process supervision timings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Time between the graceful-termination signal and the forced kill.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Time allowed for a force-killed process to be reaped.
    #[serde(default = "default_kill_settle_ms")]
    pub kill_settle_ms: u64,
    /// Default timeout for an operator-initiated stop-all.
    #[serde(default = "default_stop_all_timeout_seconds")]
    pub stop_all_timeout_seconds: u64,
    /// Shorter timeout used by the emergency stop.
    #[serde(default = "default_emergency_stop_timeout_seconds")]
    pub emergency_stop_timeout_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            kill_settle_ms: default_kill_settle_ms(),
            stop_all_timeout_seconds: default_stop_all_timeout_seconds(),
            emergency_stop_timeout_seconds: default_emergency_stop_timeout_seconds(),
        }
    }
}

fn default_grace_period_ms() -> u64 {
    5_000
}

fn default_kill_settle_ms() -> u64 {
    1_000
}

fn default_stop_all_timeout_seconds() -> u64 {
    30
}

fn default_emergency_stop_timeout_seconds() -> u64 {
    10
}

/// Heartbeat emission settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HeartbeatConfig {
    /// Interval between heartbeats for each running agent.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

/// Claim ledger policy.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct QueueConfig {
    /// Age after which a claim is considered stale.
    #[serde(default = "default_stale_claim_hours")]
    pub stale_claim_hours: u64,
    /// Interval of the background stale-claim sweep.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Container used when the operator assigns work without naming one.
    #[serde(default)]
    pub default_container: Option<String>,
    /// Claimable item ids per container, highest priority first.
    #[serde(default)]
    pub backlog: BTreeMap<String, Vec<String>>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stale_claim_hours: default_stale_claim_hours(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            default_container: None,
            backlog: BTreeMap::new(),
        }
    }
}

fn default_stale_claim_hours() -> u64 {
    8
}

fn default_sweep_interval_seconds() -> u64 {
    900
}

/// Loop health advisory thresholds.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct HealthConfig {
    /// Interval of the background health validation.
    #[serde(default = "default_validation_interval_seconds")]
    pub validation_interval_seconds: u64,
    /// Below this active depth, intake of new work is prioritized.
    #[serde(default = "default_low_queue_depth")]
    pub low_queue_depth: usize,
    /// Above this active depth, intake of new work is suppressed.
    #[serde(default = "default_high_queue_depth")]
    pub high_queue_depth: usize,
    /// Average cycle time above which a recommendation is raised.
    #[serde(default = "default_target_cycle_hours")]
    pub target_cycle_hours: u64,
    /// Heartbeat age after which an agent is reported stuck.
    #[serde(default = "default_stuck_after_minutes")]
    pub stuck_after_minutes: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            validation_interval_seconds: default_validation_interval_seconds(),
            low_queue_depth: default_low_queue_depth(),
            high_queue_depth: default_high_queue_depth(),
            target_cycle_hours: default_target_cycle_hours(),
            stuck_after_minutes: default_stuck_after_minutes(),
        }
    }
}

fn default_validation_interval_seconds() -> u64 {
    300
}

fn default_low_queue_depth() -> usize {
    3
}

fn default_high_queue_depth() -> usize {
    10
}

fn default_target_cycle_hours() -> u64 {
    4
}

fn default_stuck_after_minutes() -> u64 {
    30
}

/// Storage retry and audit settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct StorageConfig {
    /// Retries after a failed write or delete.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// First backoff delay; doubles on every retry.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Maximum number of entries kept in the emergency action log.
    #[serde(default = "default_emergency_log_cap")]
    pub emergency_log_cap: usize,
    /// Pause between the stop and start halves of restart/reset.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            emergency_log_cap: default_emergency_log_cap(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_emergency_log_cap() -> usize {
    100
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_ipc_name() -> String {
    "agent-loop".into()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Workspace root; state lives in `<root>/.agent-loop`.
    pub workspace_root: PathBuf,
    /// Named pipe / Unix socket identifier for `agent-loop-ctl`.
    #[serde(default = "default_ipc_name")]
    pub ipc_name: String,
    /// Treat every destructive operation as pre-confirmed (automated mode).
    #[serde(default)]
    pub skip_confirmation: bool,
    /// Placeholder work process.
    #[serde(default)]
    pub agent: AgentConfig,
    /// Process supervision timings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Heartbeat settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    /// Claim ledger policy.
    #[serde(default)]
    pub queue: QueueConfig,
    /// Loop health thresholds.
    #[serde(default)]
    pub health: HealthConfig,
    /// Storage retry and audit settings.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and normalize paths.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Configuration rooted at `workspace_root` with every other value defaulted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the workspace root does not exist.
    pub fn for_workspace(workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let mut config = Self {
            workspace_root: workspace_root.into(),
            ipc_name: default_ipc_name(),
            skip_confirmation: false,
            agent: AgentConfig::default(),
            supervisor: SupervisorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Directory holding sessions, the claim ledger, and the logs.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root.join(STATE_DIR_NAME)
    }

    /// Grace period between terminate and kill.
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.supervisor.grace_period_ms)
    }

    /// Settle time after a forced kill.
    #[must_use]
    pub fn kill_settle(&self) -> Duration {
        Duration::from_millis(self.supervisor.kill_settle_ms)
    }

    /// Heartbeat emission interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval_ms)
    }

    /// Stale-claim threshold as a chrono duration.
    #[must_use]
    pub fn stale_claim_after(&self) -> chrono::Duration {
        i64::try_from(self.queue.stale_claim_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Delay between the halves of restart and reset.
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.storage.restart_delay_ms)
    }

    /// Bound on an operator `stop-all` and on shutdown.
    #[must_use]
    pub fn stop_all_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.stop_all_timeout_seconds)
    }

    /// Bound on `emergency-stop`.
    #[must_use]
    pub fn emergency_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.emergency_stop_timeout_seconds)
    }

    /// Stale-claim sweep period.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.queue.sweep_interval_seconds)
    }

    /// Health validation period.
    #[must_use]
    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.health.validation_interval_seconds)
    }

    /// Replace the workspace root, canonicalizing the new path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the path does not exist.
    pub fn override_workspace_root(&mut self, root: &Path) -> Result<()> {
        self.workspace_root = root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("invalid workspace override: {err}")))?;
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.heartbeat.interval_ms == 0 {
            return Err(AppError::Config(
                "heartbeat.interval_ms must be greater than zero".into(),
            ));
        }

        if self.queue.sweep_interval_seconds == 0 || self.health.validation_interval_seconds == 0 {
            return Err(AppError::Config(
                "background task intervals must be greater than zero".into(),
            ));
        }

        if self.health.low_queue_depth > self.health.high_queue_depth {
            return Err(AppError::Config(
                "health.low_queue_depth must not exceed health.high_queue_depth".into(),
            ));
        }

        if self.supervisor.stop_all_timeout_seconds == 0
            || self.supervisor.emergency_stop_timeout_seconds == 0
        {
            return Err(AppError::Config(
                "supervisor stop-all timeouts must be greater than zero".into(),
            ));
        }

        if self.queue.stale_claim_hours > MAX_THRESHOLD_HOURS
            || self.health.target_cycle_hours > MAX_THRESHOLD_HOURS
            || self.health.stuck_after_minutes > MAX_THRESHOLD_HOURS * 60
        {
            return Err(AppError::Config(format!(
                "staleness, cycle, and stuck thresholds must not exceed {MAX_THRESHOLD_HOURS} hours"
            )));
        }

        if self.storage.emergency_log_cap == 0 {
            return Err(AppError::Config(
                "storage.emergency_log_cap must be greater than zero".into(),
            ));
        }

        if self.agent.command.trim().is_empty() {
            return Err(AppError::Config("agent.command must not be empty".into()));
        }

        let canonical_root = self
            .workspace_root
            .canonicalize()
            .map_err(|err| AppError::Config(format!("workspace_root invalid: {err}")))?;
        self.workspace_root = canonical_root;

        Ok(())
    }
}
