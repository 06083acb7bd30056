//! Execution-loop health: cycle times, stuck agents, queue pressure.
//!
//! The validator only reads sessions and claims through the narrow
//! [`SessionReader`] and [`ClaimReader`] traits. Its own write path is the
//! transition log, which feeds cycle metrics and nothing else.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::HealthConfig;
use crate::models::health::HealthStatus;
use crate::models::session::AgentStatus;
use crate::models::transition::{cycle_metrics, CycleMetrics, StateTransition};
use crate::persistence::{ClaimReader, SessionReader, SessionStore, TransitionLog, WorkQueue};
use crate::Result;

/// Thresholds applied by [`LoopHealthValidator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// Prioritize intake below this active depth.
    pub low_queue_depth: usize,
    /// Suppress intake above this active depth.
    pub high_queue_depth: usize,
    /// Average cycle time considered too slow.
    pub target_cycle: Duration,
    /// Heartbeat age beyond which an agent is stuck.
    pub stuck_after: Duration,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            low_queue_depth: config.low_queue_depth,
            high_queue_depth: config.high_queue_depth,
            target_cycle: Duration::from_secs(config.target_cycle_hours.saturating_mul(3600)),
            stuck_after: Duration::from_secs(config.stuck_after_minutes.saturating_mul(60)),
        }
    }
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// An agent whose heartbeat is older than the stuck threshold.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StuckAgent {
    /// Agent id.
    pub agent_id: u32,
    /// Declared status, which does not affect the verdict.
    pub status: AgentStatus,
    /// Heartbeat age in milliseconds.
    pub heartbeat_age_ms: u64,
    /// Work item the agent holds, if any.
    pub current_work_item: Option<String>,
}

/// Queue pressure.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct QueueDepth {
    /// Active claims in the ledger.
    pub active: usize,
    /// Agents currently reviewing.
    pub reviewable: usize,
}

/// Category of a [`Recommendation`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    /// Queue is running dry.
    PrioritizeIntake,
    /// Queue is overloaded.
    SuppressIntake,
    /// Average cycle time exceeds the target.
    SlowCycles,
    /// Some agents are stuck.
    StuckAgents,
    /// Some agents stopped heartbeating.
    UnresponsiveAgents,
}

/// Advisory produced by [`LoopHealthValidator::overall_health`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Recommendation {
    /// Category.
    pub kind: RecommendationKind,
    /// Operator-facing text.
    pub message: String,
}

/// Aggregate health verdict.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LoopHealthReport {
    /// False when any agent is stuck or unresponsive.
    pub healthy: bool,
    /// Advisories, in no particular priority.
    pub recommendations: Vec<Recommendation>,
    /// Stuck agents.
    pub stuck: Vec<StuckAgent>,
    /// Unresponsive agents that are not already reported as stuck.
    pub unresponsive: Vec<u32>,
    /// Queue pressure at check time.
    pub queue_depth: QueueDepth,
    /// Mean cycle time across all agents, in milliseconds.
    pub average_cycle_ms: Option<u64>,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

/// Validator over the file-backed stores.
pub type StoreHealthValidator = LoopHealthValidator<SessionStore, WorkQueue>;

/// Computes loop health from sessions, claims, and the transition log.
pub struct LoopHealthValidator<S, C> {
    sessions: Arc<S>,
    claims: Arc<C>,
    transitions: Arc<TransitionLog>,
    thresholds: HealthThresholds,
}

impl<S: SessionReader, C: ClaimReader> LoopHealthValidator<S, C> {
    /// Construct a validator.
    #[must_use]
    pub fn new(
        sessions: Arc<S>,
        claims: Arc<C>,
        transitions: Arc<TransitionLog>,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            sessions,
            claims,
            transitions,
            thresholds,
        }
    }

    /// Thresholds in effect.
    #[must_use]
    pub fn thresholds(&self) -> HealthThresholds {
        self.thresholds
    }

    /// Append a transition to the log.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the entry cannot be written.
    pub fn log_transition(
        &self,
        agent_id: u32,
        from: AgentStatus,
        to: AgentStatus,
        work_item_id: Option<String>,
    ) -> Result<()> {
        self.transitions
            .append(&StateTransition::new(agent_id, from, to, work_item_id))
    }

    /// Cycle statistics for one agent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the transition log cannot be read.
    pub fn cycle_metrics(&self, agent_id: u32) -> Result<CycleMetrics> {
        let transitions = self.transitions.for_agent(agent_id)?;
        Ok(cycle_metrics(&transitions))
    }

    /// Agents whose heartbeat age exceeds the stuck threshold.
    ///
    /// # Errors
    ///
    /// Returns the storage error if sessions cannot be listed.
    pub async fn detect_stuck(&self) -> Result<Vec<StuckAgent>> {
        let now = Utc::now();
        let limit = u64::try_from(self.thresholds.stuck_after.as_millis()).unwrap_or(u64::MAX);
        Ok(self
            .sessions
            .list()
            .await?
            .into_iter()
            .filter_map(|session| {
                let age = session.heartbeat_age_ms(now);
                (age > limit).then(|| StuckAgent {
                    agent_id: session.agent_id,
                    status: session.status,
                    heartbeat_age_ms: age,
                    current_work_item: session.current_work_item,
                })
            })
            .collect())
    }

    /// Active claims and reviewing agents.
    ///
    /// # Errors
    ///
    /// Returns the storage error if claims or sessions cannot be read.
    pub async fn queue_depth(&self) -> Result<QueueDepth> {
        let active = self.claims.list_active().await?.len();
        let reviewable = self
            .sessions
            .list()
            .await?
            .iter()
            .filter(|s| s.status == AgentStatus::Reviewing)
            .count();
        Ok(QueueDepth { active, reviewable })
    }

    /// Run every check and collect advisories.
    ///
    /// # Errors
    ///
    /// Returns the storage error if any input cannot be read.
    pub async fn overall_health(&self) -> Result<LoopHealthReport> {
        let now = Utc::now();
        let stuck = self.detect_stuck().await?;
        let queue_depth = self.queue_depth().await?;
        let unresponsive: Vec<u32> = self
            .sessions
            .list()
            .await?
            .iter()
            .filter(|s| {
                HealthStatus::from_age_ms(s.heartbeat_age_ms(now)) == HealthStatus::Unresponsive
            })
            .map(|s| s.agent_id)
            .filter(|id| !stuck.iter().any(|a| a.agent_id == *id))
            .collect();
        let average_cycle_ms = self.fleet_average_cycle_ms()?;

        let mut recommendations = Vec::new();
        if queue_depth.active < self.thresholds.low_queue_depth {
            recommendations.push(Recommendation {
                kind: RecommendationKind::PrioritizeIntake,
                message: format!(
                    "only {} active claim(s); prioritize intake of new work",
                    queue_depth.active
                ),
            });
        } else if queue_depth.active > self.thresholds.high_queue_depth {
            recommendations.push(Recommendation {
                kind: RecommendationKind::SuppressIntake,
                message: format!(
                    "{} active claims; suppress intake until the queue drains",
                    queue_depth.active
                ),
            });
        }

        let target_ms = u64::try_from(self.thresholds.target_cycle.as_millis()).unwrap_or(u64::MAX);
        if let Some(avg) = average_cycle_ms.filter(|&avg| avg > target_ms) {
            recommendations.push(Recommendation {
                kind: RecommendationKind::SlowCycles,
                message: format!(
                    "average cycle time {:.1}h exceeds the {:.1}h target",
                    hours(avg),
                    hours(target_ms)
                ),
            });
        }

        if !stuck.is_empty() {
            let ids: Vec<String> = stuck.iter().map(|a| a.agent_id.to_string()).collect();
            recommendations.push(Recommendation {
                kind: RecommendationKind::StuckAgents,
                message: format!("restart stuck agent(s): {}", ids.join(", ")),
            });
        }
        if !unresponsive.is_empty() {
            let ids: Vec<String> = unresponsive.iter().map(u32::to_string).collect();
            recommendations.push(Recommendation {
                kind: RecommendationKind::UnresponsiveAgents,
                message: format!("agent(s) not heartbeating: {}", ids.join(", ")),
            });
        }

        let healthy = stuck.is_empty() && unresponsive.is_empty();
        if healthy {
            info!(active = queue_depth.active, "loop health check passed");
        } else {
            warn!(
                stuck = stuck.len(),
                unresponsive = unresponsive.len(),
                "loop health check found problems"
            );
        }

        Ok(LoopHealthReport {
            healthy,
            recommendations,
            stuck,
            unresponsive,
            queue_depth,
            average_cycle_ms,
            checked_at: now,
        })
    }

    /// Total cycle time over total cycles, across every agent.
    fn fleet_average_cycle_ms(&self) -> Result<Option<u64>> {
        let mut by_agent: BTreeMap<u32, Vec<StateTransition>> = BTreeMap::new();
        for transition in self.transitions.read_all()? {
            by_agent
                .entry(transition.agent_id)
                .or_default()
                .push(transition);
        }

        let (total_ms, cycles) = by_agent
            .values()
            .map(|log| cycle_metrics(log))
            .filter_map(|m| Some((m.average_cycle_ms? * m.cycles_completed, m.cycles_completed)))
            .fold((0u64, 0u64), |(t, c), (mt, mc)| {
                (t.saturating_add(mt), c + mc)
            });
        Ok((cycles > 0).then(|| total_ms / cycles))
    }
}

#[allow(clippy::cast_precision_loss)]
fn hours(ms: u64) -> f64 {
    ms as f64 / 3_600_000.0
}
