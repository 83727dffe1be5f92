//! `HealthChecker` (`spec.md` §4.8) — the per-agent operation tying the
//! pool, cache, detector, tracker, and notification queue together.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::{LayeredCache, Namespace};
use crate::detector::{CrashDetector, PriorContext};
use crate::error::AdapterError;
use crate::model::{now_unix, AgentState, HealthVerdict, PaneSnapshot, VerdictKind};
use crate::notification::{Notification, NotificationQueue, Severity};
use crate::pool::ConnectionPool;
use crate::target::Target;
use crate::tmux::TmuxAdapter as _;
use crate::tracker::{StateTracker, TransitionRecord};

const RETRY_JITTER_MIN_MS: u64 = 50;
const RETRY_JITTER_MAX_MS: u64 = 150;
const DEFAULT_CHECK_BUDGET: Duration = Duration::from_secs(15);

pub struct HealthChecker {
    pool: Arc<ConnectionPool>,
    cache: Arc<LayeredCache<Target, PaneSnapshot>>,
    detector: Arc<CrashDetector>,
    tracker: Arc<StateTracker>,
    notifications: Arc<NotificationQueue>,
    grace_period: Duration,
    check_budget: Duration,
}

impl HealthChecker {
    pub fn new(
        pool: Arc<ConnectionPool>,
        cache: Arc<LayeredCache<Target, PaneSnapshot>>,
        detector: Arc<CrashDetector>,
        tracker: Arc<StateTracker>,
        notifications: Arc<NotificationQueue>,
        grace_period: Duration,
    ) -> Self {
        Self {
            pool,
            cache,
            detector,
            tracker,
            notifications,
            grace_period,
            check_budget: DEFAULT_CHECK_BUDGET,
        }
    }

    /// Run one health check for `target`, honoring the cancellation token for
    /// the wall-clock budget described in `spec.md` §5.
    pub async fn check(&self, target: &Target, cancel: &CancellationToken) -> Option<TransitionRecord> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = tokio::time::timeout(self.check_budget, self.check_inner(target)) => {
                match result {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(%target, "health check exceeded wall-clock budget, treating as transient");
                        None
                    }
                }
            }
        }
    }

    async fn check_inner(&self, target: &Target) -> Option<TransitionRecord> {
        // Snapshot the previous capture's hash before `capture_with_retry`
        // overwrites the cache entry with this cycle's capture.
        let previous_hash = self.previous_hash(target);

        let snapshot = match self.capture_with_retry(target).await {
            Ok(s) => s,
            Err(AdapterError::Permanent(reason)) => {
                warn!(%target, reason, "permanent adapter error, marking GONE");
                return self.tracker.force_gone(target);
            }
            Err(AdapterError::Transient(reason)) => {
                warn!(%target, reason, "health check degraded to UNKNOWN verdict");
                let verdict = HealthVerdict::unknown(reason, now_unix());
                return self.tracker.apply(target, &verdict);
            }
        };

        let prior_agent = self.tracker.get(target);
        let prior = self.build_prior_context(&prior_agent, previous_hash);
        let verdict = self.detector.classify(&snapshot, &prior);

        let transition = self.tracker.apply(target, &verdict);
        if let Some(t) = &transition {
            self.notifications.enqueue(derive_notification(t, &verdict));
        }
        transition
    }

    fn build_prior_context(
        &self,
        prior_agent: &Option<crate::model::Agent>,
        previous_hash: Option<u64>,
    ) -> PriorContext {
        match prior_agent {
            Some(agent) => {
                let in_grace_window =
                    now_unix().saturating_sub(agent.discovered_at) < self.grace_period.as_secs();
                PriorContext {
                    previous_snapshot_hash: previous_hash,
                    previous_verdict_kind: Some(state_to_verdict_kind(agent.state)),
                    consecutive_idle_samples: agent.consecutive_idle_samples,
                    in_grace_window,
                }
            }
            None => PriorContext {
                previous_snapshot_hash: None,
                previous_verdict_kind: None,
                consecutive_idle_samples: 0,
                in_grace_window: true,
            },
        }
    }

    /// Single retry with jitter on transient failure (`spec.md` §4.8, §7).
    ///
    /// Always captures live and writes through `cache.put` rather than
    /// `get_or_compute`: `previous_hash` reads the same TTL-gated entry, so
    /// short-circuiting the capture on a cache hit would make every
    /// comparison trivial (hit => unchanged, miss => changed) instead of a
    /// real content comparison.
    async fn capture_with_retry(&self, target: &Target) -> Result<PaneSnapshot, AdapterError> {
        let result = capture_once(&self.pool, target).await;

        let result = match result {
            Ok(s) => Ok(s),
            Err(AdapterError::Transient(reason)) => {
                let jitter = rand::rng().random_range(RETRY_JITTER_MIN_MS..=RETRY_JITTER_MAX_MS);
                tokio::time::sleep(Duration::from_millis(jitter)).await;
                capture_once(&self.pool, target).await.map_err(|_| AdapterError::Transient(reason))
            }
            Err(e) => Err(e),
        };

        if let Ok(snapshot) = &result {
            self.cache.put(Namespace::PaneContent, target.clone(), snapshot.clone());
        }

        result
    }

    pub fn previous_hash(&self, target: &Target) -> Option<u64> {
        self.cache.get(Namespace::PaneContent, target).map(|s| s.content_hash)
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }
}

async fn capture_once(pool: &Arc<ConnectionPool>, target: &Target) -> Result<PaneSnapshot, AdapterError> {
    let guard = pool
        .acquire()
        .await
        .map_err(|_| AdapterError::Transient("pool exhausted".to_string()))?;
    guard.adapter().capture(target, guard.adapter().default_capture_lines()).await
}

fn state_to_verdict_kind(state: AgentState) -> VerdictKind {
    match state {
        AgentState::Starting | AgentState::Recovering => VerdictKind::Starting,
        AgentState::Active => VerdictKind::Active,
        AgentState::Idle => VerdictKind::Idle,
        AgentState::Stuck => VerdictKind::Stuck,
        AgentState::Crashed | AgentState::Gone => VerdictKind::Crashed,
    }
}

fn derive_notification(transition: &TransitionRecord, verdict: &HealthVerdict) -> Notification {
    let severity = match transition.to {
        AgentState::Crashed => Severity::Error,
        AgentState::Stuck => Severity::Warn,
        AgentState::Gone => Severity::Warn,
        _ => Severity::Info,
    };
    Notification::new(
        transition.target.clone(),
        severity,
        format!("{:?}", transition.to).to_uppercase(),
        format!(
            "{} -> {:?} ({})",
            transition.target, transition.to, verdict.reason
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, CrashConfig, PoolConfig};
    use crate::tmux::mock::MockTmuxAdapter;

    fn checker_with(mock: Arc<MockTmuxAdapter>) -> HealthChecker {
        checker_with_grace(mock, Duration::from_secs(180))
    }

    fn checker_with_grace(mock: Arc<MockTmuxAdapter>, grace_period: Duration) -> HealthChecker {
        let pool = ConnectionPool::new(PoolConfig::default(), {
            let mock = mock.clone();
            move || mock.clone()
        });
        let cache = Arc::new(LayeredCache::new(CacheConfig::default()));
        let detector = Arc::new(CrashDetector::compile(&CrashConfig::default()).unwrap());
        let tracker = Arc::new(StateTracker::new(3, 2));
        let notifications = NotificationQueue::new(100, Duration::from_secs(60));
        HealthChecker::new(pool, cache, detector, tracker.clone(), notifications, grace_period)
    }

    #[tokio::test]
    async fn permanent_error_marks_gone_immediately() {
        let mock = Arc::new(MockTmuxAdapter::new());
        let target: Target = "a:0".parse().unwrap();
        mock.add_target(target.clone(), vec!["hi".into()]);
        mock.fail_capture(target.clone(), AdapterError::Permanent("gone".into()));

        let checker = checker_with(mock);
        checker.tracker.observe_discovered(&target, crate::model::AgentRole::Developer);
        let cancel = CancellationToken::new();
        let transition = checker.check(&target, &cancel).await.unwrap();
        assert_eq!(transition.to, AgentState::Gone);
    }

    #[tokio::test]
    async fn transient_error_yields_no_transition() {
        let mock = Arc::new(MockTmuxAdapter::new());
        let target: Target = "a:0".parse().unwrap();
        mock.add_target(target.clone(), vec!["hi".into()]);
        mock.fail_capture(target.clone(), AdapterError::Transient("flaky".into()));

        let checker = checker_with(mock);
        checker.tracker.observe_discovered(&target, crate::model::AgentRole::Developer);
        let cancel = CancellationToken::new();
        let transition = checker.check(&target, &cancel).await;
        assert!(transition.is_none());
        assert_eq!(checker.tracker.get(&target).unwrap().state, AgentState::Starting);
    }

    #[tokio::test]
    async fn changed_pane_transitions_starting_to_active() {
        let mock = Arc::new(MockTmuxAdapter::new());
        let target: Target = "a:0".parse().unwrap();
        mock.add_target(target.clone(), vec!["first".into(), "second".into()]);

        let checker = checker_with_grace(mock, Duration::from_secs(0));
        checker.tracker.observe_discovered(&target, crate::model::AgentRole::Developer);
        let cancel = CancellationToken::new();
        let t = checker.check(&target, &cancel).await.unwrap();
        assert_eq!(t.to, AgentState::Active);
    }
}
