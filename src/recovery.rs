//! `PmRecovery` (`spec.md` §4.9) — detects PM crashes, enforces
//! grace/cooldown/backoff, and spawns a replacement PM.
//!
//! Driven entirely by `TransitionRecord`s emitted by `StateTracker`; never
//! calls back into the tracker's verdict-application path, only its plain
//! PM-record getters/setters (`spec.md` §9, cyclic-reference note).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RecoveryConfig;
use crate::error::CoreError;
use crate::model::{now_unix, AgentRole, AgentState, Timestamp};
use crate::notification::{Notification, NotificationQueue, Severity};
use crate::pool::ConnectionPool;
use crate::target::Target;
use crate::tracker::{StateTracker, TransitionRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    None,
    Success,
    Failure,
    Exhausted,
}

impl RecoveryOutcome {
    pub fn as_u8(self) -> u8 {
        match self {
            RecoveryOutcome::None => 0,
            RecoveryOutcome::Success => 1,
            RecoveryOutcome::Failure => 2,
            RecoveryOutcome::Exhausted => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => RecoveryOutcome::Success,
            2 => RecoveryOutcome::Failure,
            3 => RecoveryOutcome::Exhausted,
            _ => RecoveryOutcome::None,
        }
    }
}

/// Per-session PM recovery bookkeeping (`spec.md` §3). Owned by
/// `StateTracker`; `PmRecovery` reads and writes it through the tracker's
/// plain accessor methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PmRecoveryRecord {
    pub attempt_count: u8,
    pub last_attempt_at: Timestamp,
    pub grace_until: Timestamp,
    pub cooldown_until: Timestamp,
    pub last_outcome: RecoveryOutcome,
}

impl Default for PmRecoveryRecord {
    fn default() -> Self {
        Self {
            attempt_count: 0,
            last_attempt_at: 0,
            grace_until: 0,
            cooldown_until: 0,
            last_outcome: RecoveryOutcome::None,
        }
    }
}

/// Computes the back-off delay before the `attempt_index`-th (0-based)
/// recovery attempt: `cooldown_base * min(growth^attempt_index, cap_factor)`
/// (`spec.md` §4.9, §8.5).
pub fn backoff_delay(config: &RecoveryConfig, attempt_index: u32) -> std::time::Duration {
    let factor = config.cooldown_growth.powi(attempt_index as i32).min(config.cooldown_cap_factor);
    std::time::Duration::from_secs_f64(config.cooldown_base_secs as f64 * factor)
}

pub struct PmRecovery {
    tracker: Arc<StateTracker>,
    notifications: Arc<NotificationQueue>,
    pool: Arc<ConnectionPool>,
    config: RecoveryConfig,
}

impl PmRecovery {
    pub fn new(
        tracker: Arc<StateTracker>,
        notifications: Arc<NotificationQueue>,
        pool: Arc<ConnectionPool>,
        config: RecoveryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tracker,
            notifications,
            pool,
            config,
        })
    }

    /// Entry point called by the scheduler after a cycle's transitions are
    /// applied: inspect every transition for a PM reaching `CRASHED`/`GONE`
    /// and kick off (or continue) the recovery state machine for its
    /// session.
    pub async fn handle_transitions(self: &Arc<Self>, transitions: &[TransitionRecord]) {
        for t in transitions {
            if !t.role.is_pm() {
                continue;
            }
            if matches!(t.to, AgentState::Crashed | AgentState::Gone) {
                self.on_pm_down(t.target.session()).await;
            }
        }
    }

    // Boxed because this participates in an indirect async recursion cycle
    // (on_pm_down -> spawned task -> attempt_recovery -> mark_attempt_failed
    // -> on_pm_down); without boxing, the compiler cannot compute a
    // finite-sized future for this chain.
    fn on_pm_down<'a>(
        self: &'a Arc<Self>,
        session: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let mut record = self.tracker.pm_record(session).unwrap_or_default();

            if record.attempt_count as u32 >= self.config.max_attempts as u32 {
                if record.last_outcome != RecoveryOutcome::Exhausted {
                    record.last_outcome = RecoveryOutcome::Exhausted;
                    self.tracker.set_pm_record(session, record.clone());
                    let err = CoreError::RecoveryExhausted {
                        session: session.to_string(),
                        attempts: record.attempt_count,
                    };
                    warn!(session, error = %err, "PM recovery exhausted after max attempts");
                    self.notifications.enqueue(Notification::new(
                        Target::new(session, 0).unwrap_or_else(|_| Target::new("unknown", 0).unwrap()),
                        Severity::Critical,
                        "recovery_exhausted",
                        err.to_string(),
                    ));
                }
                return;
            }

            let delay = backoff_delay(&self.config, record.attempt_count as u32);
            // Anchor from the previous attempt's own clock, not from the moment
            // this particular replacement's crash was detected, so a chain of
            // strikes reproduces the spec's literal T+30/T+90/T+210 timing
            // instead of drifting later with each detection delay.
            let anchor = if record.attempt_count > 0 {
                record.last_attempt_at
            } else {
                now_unix()
            };
            record.cooldown_until = anchor + delay.as_secs();
            let remaining = record.cooldown_until.saturating_sub(now_unix());
            self.tracker.set_pm_record(session, record);

            info!(session, delay_secs = remaining, "scheduling PM recovery attempt");

            let this = self.clone();
            let session = session.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(remaining)).await;
                this.attempt_recovery(&session).await;
            });
        })
    }

    async fn attempt_recovery(self: &Arc<Self>, session: &str) {
        let mut record = self.tracker.pm_record(session).unwrap_or_default();
        record.attempt_count += 1;
        record.last_attempt_at = now_unix();
        self.tracker.set_pm_record(session, record.clone());

        let guard = match self.pool.acquire().await {
            Ok(g) => g,
            Err(e) => {
                warn!(session, error = %e, "pool exhausted while attempting PM recovery");
                self.mark_attempt_failed(session).await;
                return;
            }
        };

        match guard
            .adapter()
            .spawn(session, "pm", &self.config.pm_launch_command)
            .await
        {
            Ok(new_target) => {
                info!(session, target = %new_target, "spawned replacement PM");
                self.tracker
                    .observe_discovered(&new_target, AgentRole::ProjectManager);

                let mut record = self.tracker.pm_record(session).unwrap_or_default();
                record.last_outcome = RecoveryOutcome::Success;
                self.tracker.set_pm_record(session, record);

                self.broadcast_resync(session, &new_target);
            }
            Err(e) => {
                warn!(session, error = %e, "failed to spawn replacement PM");
                self.mark_attempt_failed(session).await;
            }
        }
    }

    async fn mark_attempt_failed(self: &Arc<Self>, session: &str) {
        let mut record = self.tracker.pm_record(session).unwrap_or_default();
        record.last_outcome = RecoveryOutcome::Failure;
        self.tracker.set_pm_record(session, record);
        self.on_pm_down(session).await;
    }

    fn broadcast_resync(&self, session: &str, pm_target: &Target) {
        for agent in self.tracker.all_agents() {
            if agent.target.session() != session || &agent.target == pm_target {
                continue;
            }
            self.notifications.enqueue(Notification::new(
                agent.target,
                Severity::Warn,
                "pm_restarted",
                "PM restarted; please resynchronise".to_string(),
            ));
        }
    }

    /// Called once a PM transition into `ACTIVE` (post-recovery-confirmation)
    /// is observed, to reset the episode counter (`spec.md` §3, §4.9).
    pub fn confirm_healthy(&self, session: &str) {
        self.tracker.reset_pm_record(session);
        info!(session, "PM recovery confirmed, episode reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RecoveryConfig {
            cooldown_base_secs: 30,
            cooldown_growth: 2.0,
            cooldown_cap_factor: 8.0,
            ..RecoveryConfig::default()
        };
        assert_eq!(backoff_delay(&config, 0).as_secs(), 30);
        assert_eq!(backoff_delay(&config, 1).as_secs(), 60);
        assert_eq!(backoff_delay(&config, 2).as_secs(), 120);
        // growth^3 = 8, at the cap
        assert_eq!(backoff_delay(&config, 3).as_secs(), 240);
        // growth^4 = 16 > cap of 8 -> clamped
        assert_eq!(backoff_delay(&config, 4).as_secs(), 240);
    }

    #[test]
    fn outcome_round_trips_through_u8() {
        for o in [
            RecoveryOutcome::None,
            RecoveryOutcome::Success,
            RecoveryOutcome::Failure,
            RecoveryOutcome::Exhausted,
        ] {
            assert_eq!(RecoveryOutcome::from_u8(o.as_u8()), o);
        }
    }
}
