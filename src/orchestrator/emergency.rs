//! Operator-triggered bulk recovery with an audit trail.
//!
//! Every operation writes exactly one [`ActionLogEntry`] before it returns,
//! declined confirmations included. A failing audit write is logged and
//! otherwise ignored; it never changes the outcome of the operation.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use super::fleet::Fleet;
use super::loop_health::StoreHealthValidator;
use crate::audit::{ActionLogEntry, ActionLogger, ActionResult, EmergencyAction};
use crate::models::agent_identity;
use crate::models::claim::WorkClaim;
use crate::models::session::{AgentSession, AgentStatus, SessionPatch};
use crate::persistence::{SessionStore, WorkQueue};
use crate::{AppError, Result};

/// Timing and policy knobs for [`EmergencyController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmergencyPolicy {
    /// Treat every destructive call as confirmed.
    pub skip_confirmation: bool,
    /// Pause between the stop and start halves of restart and reset.
    pub restart_delay: Duration,
    /// Claim age at which a claim is stale.
    pub stale_claim_after: chrono::Duration,
}

/// Result of [`EmergencyController::stop_all`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StopAllSummary {
    /// Agents that were running and are now stopped.
    pub agents_stopped: usize,
    /// Claims removed from the ledger.
    pub claims_released: usize,
    /// Agents that had to be force-killed after the timeout.
    pub forced: Vec<u32>,
}

/// Result of [`EmergencyController::reset_state`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetSummary {
    /// Claims the agent held before the reset.
    pub claims_released: usize,
    /// The fresh session.
    pub session: AgentSession,
}

/// One entry of [`EmergencyController::recovery_options`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecoveryOption {
    /// Stable identifier, also the `agent-loop-ctl` subcommand.
    pub id: &'static str,
    /// Short label.
    pub title: &'static str,
    /// What the option does.
    pub description: &'static str,
    /// Whether it needs confirmation.
    pub destructive: bool,
    /// Whether current state calls for it.
    pub applicable: bool,
}

/// Bulk stop, restart, reset, and claim recovery.
pub struct EmergencyController {
    fleet: Arc<Fleet>,
    sessions: Arc<SessionStore>,
    queue: Arc<WorkQueue>,
    health: Arc<StoreHealthValidator>,
    audit: Arc<dyn ActionLogger>,
    policy: EmergencyPolicy,
}

impl EmergencyController {
    /// Construct a controller.
    #[must_use]
    pub fn new(
        fleet: Arc<Fleet>,
        sessions: Arc<SessionStore>,
        queue: Arc<WorkQueue>,
        health: Arc<StoreHealthValidator>,
        audit: Arc<dyn ActionLogger>,
        policy: EmergencyPolicy,
    ) -> Self {
        Self {
            fleet,
            sessions,
            queue,
            health,
            audit,
            policy,
        }
    }

    /// Stop every agent within `timeout` and release every claim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfirmationDeclined` without acting unless
    /// confirmed, or the ledger error if claims cannot be released.
    pub async fn stop_all(
        &self,
        actor: &str,
        confirmed: bool,
        timeout: Duration,
    ) -> Result<StopAllSummary> {
        let action = EmergencyAction::StopAll;
        self.require_confirmation(action, actor, confirmed, "stop all agents")?;

        async {
            let report = self.fleet.stop_all(timeout).await;
            let agents_stopped = report.total();

            match self.queue.clear_all().await {
                Ok(claims_released) => {
                    let result = if report.timed_out {
                        ActionResult::Partial
                    } else {
                        ActionResult::Success
                    };
                    let mut details = format!(
                        "stopped {agents_stopped} agent(s), released {claims_released} claim(s)"
                    );
                    if report.timed_out {
                        let _ = write!(
                            details,
                            "; timed out after {}s, force-killed {:?}",
                            timeout.as_secs(),
                            report.forced
                        );
                    }
                    self.record(action, actor, result, details);
                    Ok(StopAllSummary {
                        agents_stopped,
                        claims_released,
                        forced: report.forced,
                    })
                }
                Err(err) => {
                    self.record(
                        action,
                        actor,
                        ActionResult::Partial,
                        format!("stopped {agents_stopped} agent(s); releasing claims failed: {err}"),
                    );
                    Err(err)
                }
            }
        }
        .instrument(info_span!("emergency_stop_all", actor))
        .await
    }

    /// Stop the agent, clear its error state, wait, and start it again.
    ///
    /// Lifetime history (`tasks_completed`, branch) is preserved.
    ///
    /// # Errors
    ///
    /// Propagates the first failing step after logging it.
    pub async fn restart(&self, actor: &str, agent_id: u32) -> Result<AgentSession> {
        let action = EmergencyAction::Restart;
        let outcome = async {
            self.fleet.stop(agent_id).await?;
            // An untracked agent can still read as busy; idle it here or the
            // refreshed heartbeat makes `start` see a live session.
            let cleared = SessionPatch::status(AgentStatus::Idle)
                .with_work_item(None)
                .with_task_description(None)
                .with_phase(None)
                .with_last_error(None)
                .with_error_count(0);
            match self.sessions.update(agent_id, cleared).await {
                Ok(_) | Err(AppError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
            tokio::time::sleep(self.policy.restart_delay).await;
            self.fleet.start(agent_id).await
        }
        .instrument(info_span!("emergency_restart", actor, agent_id))
        .await;

        match &outcome {
            Ok(_) => self.record(
                action,
                actor,
                ActionResult::Success,
                format!("agent {agent_id} restarted"),
            ),
            Err(err) => self.record(
                action,
                actor,
                ActionResult::Failure,
                format!("agent {agent_id} restart failed: {err}"),
            ),
        }
        outcome
    }

    /// Release the agent's claims, stop it, delete its session, wait, and
    /// start it from zero.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfirmationDeclined` without acting unless
    /// confirmed, otherwise the first failing step.
    pub async fn reset_state(
        &self,
        actor: &str,
        agent_id: u32,
        confirmed: bool,
    ) -> Result<ResetSummary> {
        let action = EmergencyAction::ResetState;
        self.require_confirmation(
            action,
            actor,
            confirmed,
            &format!("reset agent {agent_id}"),
        )?;

        let mut claims_released = 0;
        let outcome = async {
            claims_released = self
                .queue
                .release_owned_by(&agent_identity(agent_id))
                .await?
                .len();
            self.fleet.stop(agent_id).await?;
            self.sessions.delete(agent_id).await?;
            tokio::time::sleep(self.policy.restart_delay).await;
            self.fleet.start(agent_id).await
        }
        .instrument(info_span!("emergency_reset", actor, agent_id))
        .await;

        match outcome {
            Ok(session) => {
                self.record(
                    action,
                    actor,
                    ActionResult::Success,
                    format!("agent {agent_id} reset, released {claims_released} claim(s)"),
                );
                Ok(ResetSummary {
                    claims_released,
                    session,
                })
            }
            Err(err) => {
                let result = if claims_released > 0 {
                    ActionResult::Partial
                } else {
                    ActionResult::Failure
                };
                self.record(
                    action,
                    actor,
                    result,
                    format!(
                        "agent {agent_id} reset failed after releasing {claims_released} claim(s): {err}"
                    ),
                );
                Err(err)
            }
        }
    }

    /// Release every claim older than the staleness threshold.
    ///
    /// # Errors
    ///
    /// Returns the ledger error after logging it.
    pub async fn recover_stuck_claims(&self, actor: &str) -> Result<Vec<WorkClaim>> {
        self.release_stale_claims(actor, true).await
    }

    /// Periodic variant of [`Self::recover_stuck_claims`]: a sweep that
    /// releases nothing leaves no audit entry, so routine ticks do not
    /// push operator actions out of the capped log.
    ///
    /// # Errors
    ///
    /// Returns the ledger error after logging it.
    pub async fn sweep_stale_claims(&self, actor: &str) -> Result<Vec<WorkClaim>> {
        self.release_stale_claims(actor, false).await
    }

    async fn release_stale_claims(&self, actor: &str, audit_noop: bool) -> Result<Vec<WorkClaim>> {
        let action = EmergencyAction::RecoverStuckClaims;
        let outcome = self
            .queue
            .release_stale(Utc::now(), self.policy.stale_claim_after)
            .instrument(info_span!("recover_stuck_claims", actor))
            .await;

        match &outcome {
            Ok(released) => {
                let items: Vec<String> = released
                    .iter()
                    .map(|c| format!("{}/{} ({})", c.container_id, c.work_item_id, c.claimed_by))
                    .collect();
                if items.is_empty() {
                    if audit_noop {
                        let details = "no stale claims".to_owned();
                        self.record(action, actor, ActionResult::Success, details);
                    }
                } else {
                    let details =
                        format!("released {} stale claim(s): {}", items.len(), items.join(", "));
                    self.record(action, actor, ActionResult::Success, details);
                }
            }
            Err(err) => self.record(
                action,
                actor,
                ActionResult::Failure,
                format!("stale claim recovery failed: {err}"),
            ),
        }
        outcome
    }

    /// Remove every claim from the ledger.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfirmationDeclined` without acting unless
    /// confirmed, or the ledger error.
    pub async fn purge_queue(&self, actor: &str, confirmed: bool) -> Result<usize> {
        let action = EmergencyAction::PurgeQueue;
        self.require_confirmation(action, actor, confirmed, "purge the work queue")?;

        let outcome = self
            .queue
            .clear_all()
            .instrument(info_span!("purge_queue", actor))
            .await;
        match &outcome {
            Ok(cleared) => self.record(
                action,
                actor,
                ActionResult::Success,
                format!("cleared {cleared} claim(s)"),
            ),
            Err(err) => self.record(
                action,
                actor,
                ActionResult::Failure,
                format!("purge failed: {err}"),
            ),
        }
        outcome
    }

    /// Recovery options with applicability computed from current state.
    ///
    /// # Errors
    ///
    /// Returns the storage error if state cannot be read.
    pub async fn recovery_options(&self, actor: &str) -> Result<Vec<RecoveryOption>> {
        let action = EmergencyAction::RecoveryOptions;
        let outcome = self.assess().await;
        match &outcome {
            Ok(options) => {
                let applicable: Vec<&str> = options
                    .iter()
                    .filter(|o| o.applicable)
                    .map(|o| o.id)
                    .collect();
                self.record(
                    action,
                    actor,
                    ActionResult::Success,
                    format!("applicable: [{}]", applicable.join(", ")),
                );
            }
            Err(err) => self.record(
                action,
                actor,
                ActionResult::Failure,
                format!("cannot assess recovery options: {err}"),
            ),
        }
        outcome
    }

    async fn assess(&self) -> Result<Vec<RecoveryOption>> {
        let stuck = !self.health.detect_stuck().await?.is_empty();
        let claims = self.queue.list_active().await?;
        let now = Utc::now();
        let stale = claims
            .iter()
            .any(|c| c.is_stale(now, self.policy.stale_claim_after));
        let running = !self.fleet.supervisor().tracked_agents().is_empty();

        Ok(vec![
            RecoveryOption {
                id: "restart",
                title: "Restart stuck agents",
                description: "Stop each stuck agent, clear its error state, and start it again.",
                destructive: false,
                applicable: stuck,
            },
            RecoveryOption {
                id: "recover-claims",
                title: "Recover stale claims",
                description: "Release every claim held longer than the staleness threshold.",
                destructive: false,
                applicable: stale,
            },
            RecoveryOption {
                id: "stop-all",
                title: "Stop all agents",
                description: "Stop every running agent and release every claim.",
                destructive: true,
                applicable: running,
            },
            RecoveryOption {
                id: "reset",
                title: "Reset an agent",
                description: "Release an agent's claims, delete its session, and start it from zero.",
                destructive: true,
                applicable: stuck,
            },
            RecoveryOption {
                id: "purge-queue",
                title: "Purge queue",
                description: "Remove every claim from the ledger.",
                destructive: true,
                applicable: !claims.is_empty(),
            },
        ])
    }

    /// Log and reject an unconfirmed destructive call.
    fn require_confirmation(
        &self,
        action: EmergencyAction,
        actor: &str,
        confirmed: bool,
        what: &str,
    ) -> Result<()> {
        if confirmed || self.policy.skip_confirmation {
            return Ok(());
        }
        info!(?action, actor, "confirmation declined");
        self.record(
            action,
            actor,
            ActionResult::Failure,
            format!("cancelled: {what} was not confirmed"),
        );
        Err(AppError::ConfirmationDeclined(what.to_owned()))
    }

    fn record(&self, action: EmergencyAction, actor: &str, result: ActionResult, details: String) {
        let entry = ActionLogEntry::new(action, actor, result, details);
        if let Err(err) = self.audit.log_entry(entry) {
            warn!(?action, %err, "failed to write emergency log entry");
        }
    }
}
