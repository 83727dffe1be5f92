//! `MonitorStrategy` (`spec.md` §4.4) — how a cycle walks the discovered
//! target list: strictly sequential or bounded-concurrency, chosen by
//! `config.strategy`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::health::HealthChecker;
use crate::target::Target;
use crate::tracker::TransitionRecord;

/// A capability a strategy requires from the runtime, checked at
/// construction so a misconfigured strategy fails fast instead of degrading
/// silently mid-cycle (`spec.md` §9, Open Questions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    BoundedConcurrency,
}

#[async_trait]
pub trait MonitorStrategy: Send + Sync {
    /// Run one cycle over `targets`, returning every transition produced, in
    /// the order `targets` were given regardless of completion order
    /// (`spec.md` §4.4 ordering note).
    async fn execute(
        &self,
        checker: &Arc<HealthChecker>,
        targets: &[Target],
        cancel: &CancellationToken,
    ) -> Vec<TransitionRecord>;

    fn required_capabilities(&self) -> &[Capability] {
        &[]
    }
}

/// One target at a time, in discovery order.
pub struct PollingStrategy;

#[async_trait]
impl MonitorStrategy for PollingStrategy {
    async fn execute(
        &self,
        checker: &Arc<HealthChecker>,
        targets: &[Target],
        cancel: &CancellationToken,
    ) -> Vec<TransitionRecord> {
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            if cancel.is_cancelled() {
                break;
            }
            if let Some(t) = checker.check(target, cancel).await {
                out.push(t);
            }
        }
        out
    }
}

/// Up to `max_parallel` targets in flight at once, results collected back in
/// the original target order (`spec.md` §4.4, §5).
pub struct ConcurrentStrategy {
    max_parallel: usize,
}

impl ConcurrentStrategy {
    pub fn new(max_parallel: usize) -> Self {
        Self {
            max_parallel: max_parallel.max(1),
        }
    }
}

#[async_trait]
impl MonitorStrategy for ConcurrentStrategy {
    async fn execute(
        &self,
        checker: &Arc<HealthChecker>,
        targets: &[Target],
        cancel: &CancellationToken,
    ) -> Vec<TransitionRecord> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut handles = Vec::with_capacity(targets.len());

        for target in targets {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let target = target.clone();
            let checker = checker.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                if cancel.is_cancelled() {
                    return None;
                }
                checker.check(&target, &cancel).await
            }));
        }

        let mut out = Vec::with_capacity(handles.len());
        for h in handles {
            if let Ok(Some(t)) = h.await {
                out.push(t);
            }
        }
        out
    }

    fn required_capabilities(&self) -> &[Capability] {
        &[Capability::BoundedConcurrency]
    }
}

/// Resolves `config.strategy` (`spec.md` §6) to a strategy instance.
pub struct StrategyRegistry;

impl StrategyRegistry {
    pub fn resolve(name: &str, max_parallel: usize) -> Arc<dyn MonitorStrategy> {
        match name {
            "polling" => Arc::new(PollingStrategy),
            _ => Arc::new(ConcurrentStrategy::new(max_parallel)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LayeredCache;
    use crate::config::{CacheConfig, CrashConfig, PoolConfig};
    use crate::detector::CrashDetector;
    use crate::notification::NotificationQueue;
    use crate::pool::ConnectionPool;
    use crate::tmux::mock::MockTmuxAdapter;
    use crate::tracker::StateTracker;
    use std::time::Duration;

    fn checker() -> (Arc<HealthChecker>, Arc<MockTmuxAdapter>) {
        let mock = Arc::new(MockTmuxAdapter::new());
        let pool = ConnectionPool::new(PoolConfig::default(), {
            let mock = mock.clone();
            move || mock.clone()
        });
        let cache = Arc::new(LayeredCache::new(CacheConfig::default()));
        let detector = Arc::new(CrashDetector::compile(&CrashConfig::default()).unwrap());
        let tracker = Arc::new(StateTracker::new(3, 2));
        let notifications = NotificationQueue::new(100, Duration::from_secs(60));
        (
            Arc::new(HealthChecker::new(
                pool,
                cache,
                detector,
                tracker,
                notifications,
                Duration::from_secs(0),
            )),
            mock,
        )
    }

    #[tokio::test]
    async fn concurrent_strategy_checks_every_target() {
        let (checker, mock) = checker();
        let targets: Vec<Target> = (0..5)
            .map(|i| {
                let t = Target::new("s", i).unwrap();
                mock.add_target(t.clone(), vec!["a".into(), "b".into()]);
                t
            })
            .collect();
        for t in &targets {
            checker.tracker().observe_discovered(t, crate::model::AgentRole::Developer);
        }

        let strategy = ConcurrentStrategy::new(2);
        let cancel = CancellationToken::new();
        let transitions = strategy.execute(&checker, &targets, &cancel).await;
        assert_eq!(transitions.len(), targets.len());
    }

    #[tokio::test]
    async fn polling_strategy_stops_on_cancellation() {
        let (checker, mock) = checker();
        let targets: Vec<Target> = (0..3)
            .map(|i| {
                let t = Target::new("s", i).unwrap();
                mock.add_target(t.clone(), vec!["a".into(), "b".into()]);
                t
            })
            .collect();
        for t in &targets {
            checker.tracker().observe_discovered(t, crate::model::AgentRole::Developer);
        }

        let strategy = PollingStrategy;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let transitions = strategy.execute(&checker, &targets, &cancel).await;
        assert!(transitions.is_empty());
    }
}
