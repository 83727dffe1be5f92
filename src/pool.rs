//! `ConnectionPool` (`spec.md` §4.2) — a bounded pool of reusable
//! `TmuxAdapter` handles with health-checked recycling. Generalizes the
//! teacher's single-adapter-per-call model (`TmuxManager::new()` was cheap
//! and stateless) into a pool because the spec's adapters are long-lived and
//! acquisition can legitimately block under load.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::CoreError;
use crate::tmux::TmuxAdapter;

struct PooledEntry {
    adapter: Arc<dyn TmuxAdapter>,
    created_at: Instant,
    last_released_at: Instant,
    poisoned: bool,
}

/// Live statistics, exposed through `MonitorScheduler::status`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max: usize,
}

struct PoolInner {
    idle: VecDeque<PooledEntry>,
    active_count: usize,
}

/// A bounded, recyclable pool of `TmuxAdapter` handles.
///
/// Pool-health invariant (`spec.md` §8.2): at all times
/// `active + idle <= max`, `idle <= max - active`, and no adapter is both
/// active and idle. This holds because every adapter lives in exactly one
/// of `inner.idle` (idle) or is represented solely by `inner.active_count`
/// (active, not retained anywhere) -- there is no structure that could hold
/// the same handle in both places at once.
pub struct ConnectionPool {
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    inner: Arc<Mutex<PoolInner>>,
    factory: Arc<dyn Fn() -> Arc<dyn TmuxAdapter> + Send + Sync>,
}

/// RAII guard returned by `acquire`; releases back to the pool on drop.
pub struct PooledAdapter {
    adapter: Option<Arc<dyn TmuxAdapter>>,
    created_at: Instant,
    acquired_at: Instant,
    poisoned: bool,
    pool: Arc<Mutex<PoolInner>>,
    config: PoolConfig,
    permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl PooledAdapter {
    pub fn adapter(&self) -> &Arc<dyn TmuxAdapter> {
        self.adapter.as_ref().expect("adapter taken before drop")
    }

    /// Mark this adapter as poisoned; it will be closed rather than returned
    /// to the idle set on drop (`spec.md` §4.2 failure policy).
    pub fn mark_poisoned(&mut self) {
        self.poisoned = true;
    }
}

impl Drop for PooledAdapter {
    fn drop(&mut self) {
        let adapter = match self.adapter.take() {
            Some(a) => a,
            None => return,
        };
        let mut inner = self.pool.lock();
        inner.active_count -= 1;

        let now = Instant::now();
        // Idle-age can't be exceeded the instant an adapter is released; only
        // total age and poisoning matter here. Idle-age eviction happens in
        // `sweep`.
        let over_total_age = now.duration_since(self.created_at)
            > Duration::from_secs(self.config.max_total_age_secs);

        if self.poisoned || over_total_age {
            debug!(poisoned = self.poisoned, over_total_age, "closing adapter instead of returning to pool");
            return;
        }

        inner.idle.push_back(PooledEntry {
            adapter,
            created_at: self.created_at,
            last_released_at: now,
            poisoned: false,
        });
        let _ = self.acquired_at;
        // permit drops here too, releasing pool capacity.
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, factory: impl Fn() -> Arc<dyn TmuxAdapter> + Send + Sync + 'static) -> Arc<Self> {
        let factory = Arc::new(factory);
        let semaphore = Arc::new(Semaphore::new(config.max));
        let mut idle = VecDeque::new();
        let now = Instant::now();
        for _ in 0..config.min {
            idle.push_back(PooledEntry {
                adapter: factory(),
                created_at: now,
                last_released_at: now,
                poisoned: false,
            });
        }

        Arc::new(Self {
            config,
            semaphore,
            inner: Arc::new(Mutex::new(PoolInner {
                idle,
                active_count: 0,
            })),
            factory,
        })
    }

    /// Acquire a pooled adapter, blocking up to `acquire_timeout`
    /// (`spec.md` §4.2). Returns `CoreError::PoolExhausted` on timeout.
    pub async fn acquire(&self) -> Result<PooledAdapter, CoreError> {
        let timeout_dur = Duration::from_secs(self.config.acquire_timeout_secs);
        let permit = tokio::time::timeout(timeout_dur, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| CoreError::PoolExhausted(timeout_dur))?
            .expect("pool semaphore never closed");

        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner.idle.pop_front();
            inner.active_count += 1;
            entry
        };

        let entry = entry.unwrap_or_else(|| PooledEntry {
            adapter: (self.factory)(),
            created_at: Instant::now(),
            last_released_at: Instant::now(),
            poisoned: false,
        });

        Ok(PooledAdapter {
            adapter: Some(entry.adapter),
            created_at: entry.created_at,
            acquired_at: Instant::now(),
            poisoned: false,
            pool: self.inner.clone(),
            config: self.config.clone(),
            permit: Some(permit),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            active: inner.active_count,
            idle: inner.idle.len(),
            max: self.config.max,
        }
    }

    /// Whether the pool has been fully saturated (no idle capacity, no
    /// permits available) at the moment of the call.
    pub fn is_saturated(&self) -> bool {
        self.semaphore.available_permits() == 0
    }

    /// One sweep: close idle adapters that exceed `max_idle`/`max_total_age`,
    /// then top back up to `min` (`spec.md` §4.2).
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let max_idle = Duration::from_secs(self.config.max_idle_secs);
        let max_total = Duration::from_secs(self.config.max_total_age_secs);

        let before = inner.idle.len();
        inner.idle.retain(|e| {
            now.duration_since(e.last_released_at) <= max_idle
                && now.duration_since(e.created_at) <= max_total
        });
        let closed = before - inner.idle.len();
        if closed > 0 {
            info!(closed, "pool sweeper closed over-aged idle adapters");
        }

        while inner.idle.len() < self.config.min {
            inner.idle.push_back(PooledEntry {
                adapter: (self.factory)(),
                created_at: now,
                last_released_at: now,
                poisoned: false,
            });
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

/// Spawns the background sweeper task described in `spec.md` §4.2, cancellable
/// via the given token (the scheduler's shutdown token, per §5).
pub fn spawn_sweeper(
    pool: Arc<ConnectionPool>,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(pool.config().sweep_interval_secs);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("pool sweeper stopping");
                    break;
                }
                _ = tokio::time::sleep(interval) => {
                    pool.sweep();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::mock::MockTmuxAdapter;

    fn test_pool(min: usize, max: usize) -> Arc<ConnectionPool> {
        let config = PoolConfig {
            min,
            max,
            acquire_timeout_secs: 1,
            max_idle_secs: 60,
            max_total_age_secs: 600,
            sweep_interval_secs: 15,
        };
        ConnectionPool::new(config, || Arc::new(MockTmuxAdapter::new()))
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let pool = test_pool(1, 2);
        assert_eq!(pool.stats().idle, 1);
        let guard = pool.acquire().await.unwrap();
        assert_eq!(pool.stats().active, 1);
        assert_eq!(pool.stats().idle, 0);
        drop(guard);
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn acquire_beyond_max_times_out() {
        let pool = test_pool(1, 1);
        let _guard = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(CoreError::PoolExhausted(_))));
    }

    #[tokio::test]
    async fn poisoned_adapter_is_not_returned_to_idle() {
        let pool = test_pool(1, 1);
        {
            let mut guard = pool.acquire().await.unwrap();
            guard.mark_poisoned();
        }
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn active_plus_idle_never_exceeds_max() {
        let pool = test_pool(2, 3);
        let g1 = pool.acquire().await.unwrap();
        let g2 = pool.acquire().await.unwrap();
        let stats = pool.stats();
        assert!(stats.active + stats.idle <= stats.max);
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn sweep_replenishes_to_min() {
        let pool = test_pool(2, 5);
        {
            let mut inner = pool.inner.lock();
            inner.idle.clear();
        }
        pool.sweep();
        assert_eq!(pool.stats().idle, 2);
    }
}
