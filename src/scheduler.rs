//! `MonitorScheduler` (`spec.md` §4.10, §5) — the top-level cycle loop:
//! discover, check, recover, notify, persist, repeat. Adapted from the
//! teacher's `MonitorService::run_loop` (`src/service/monitor.rs`), replacing
//! its hard-coded linear scan with a pluggable `MonitorStrategy` and adding
//! overlap prevention and saturation backpressure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{LayeredCache, Namespace};
use crate::config::Config;
use crate::detector::CrashDetector;
use crate::discovery::AgentDiscovery;
use crate::health::HealthChecker;
use crate::model::{Agent, AgentRole, AgentState, PaneSnapshot};
use crate::notification::{Notification, NotificationQueue, Severity};
use crate::persistence::PersistenceStore;
use crate::pool::{self, ConnectionPool};
use crate::recovery::PmRecovery;
use crate::strategy::StrategyRegistry;
use crate::target::Target;
use crate::tmux::TmuxAdapter;
use crate::tracker::StateTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub pool: crate::pool::PoolStats,
    pub agent_counts: std::collections::HashMap<AgentState, usize>,
}

/// Owns every long-lived component and drives the cycle loop described in
/// `spec.md` §4.10.
pub struct MonitorScheduler {
    config: RwLock<Config>,
    configured_max_parallel: usize,
    pool: Arc<ConnectionPool>,
    cache: Arc<LayeredCache<Target, PaneSnapshot>>,
    session_cache: Arc<LayeredCache<(), Vec<Target>>>,
    role_cache: Arc<LayeredCache<Target, AgentRole>>,
    config_cache: Arc<LayeredCache<String, Config>>,
    config_path: Mutex<Option<PathBuf>>,
    tracker: Arc<StateTracker>,
    notifications: Arc<NotificationQueue>,
    recovery: Arc<PmRecovery>,
    discovery: AgentDiscovery,
    checker: Mutex<Arc<HealthChecker>>,
    persistence: PersistenceStore,
    pm_targets: Arc<Mutex<std::collections::HashMap<String, Target>>>,
    cycle_in_progress: AtomicBool,
    cycles_completed: AtomicUsize,
    cycles_skipped: AtomicUsize,
    cancel: CancellationToken,
    saturation_started_at: Mutex<Option<Instant>>,
    graceful_shutdown: AtomicBool,
    shutdown_timeout: Mutex<Duration>,
}

impl MonitorScheduler {
    pub fn new(config: Config, adapter_factory: impl Fn() -> Arc<dyn TmuxAdapter> + Send + Sync + 'static) -> Arc<Self> {
        let configured_max_parallel = config.max_parallel;
        let pool = ConnectionPool::new(config.pool.clone(), adapter_factory);
        let cache = Arc::new(LayeredCache::new(config.cache.clone()));
        let session_cache = Arc::new(LayeredCache::new(config.cache.clone()));
        let role_cache = Arc::new(LayeredCache::new(config.cache.clone()));
        let config_cache = Arc::new(LayeredCache::new(config.cache.clone()));
        let detector = Arc::new(
            CrashDetector::compile(&config.crash).expect("classifier config must be valid at startup"),
        );
        let tracker = Arc::new(StateTracker::new(
            config.crash.missing_threshold,
            config.recovery.confirm_samples,
        ));
        let notifications = NotificationQueue::new(
            config.notifications.queue_capacity,
            Duration::from_secs(config.notifications.dedupe_window_secs),
        );
        let recovery = PmRecovery::new(tracker.clone(), notifications.clone(), pool.clone(), config.recovery.clone());
        let discovery = AgentDiscovery::new(&config.crash)
            .expect("role signature config must be valid at startup");
        let checker = HealthChecker::new(
            pool.clone(),
            cache.clone(),
            detector,
            tracker.clone(),
            notifications.clone(),
            Duration::from_secs(config.recovery.grace_period_secs),
        );
        let persistence = PersistenceStore::new(config.persistence.path.clone().into());

        Arc::new(Self {
            config: RwLock::new(config),
            configured_max_parallel,
            pool,
            cache,
            session_cache,
            role_cache,
            config_cache,
            config_path: Mutex::new(None),
            tracker,
            notifications,
            recovery,
            discovery,
            checker: Mutex::new(Arc::new(checker)),
            persistence,
            pm_targets: Arc::new(Mutex::new(std::collections::HashMap::new())),
            cycle_in_progress: AtomicBool::new(false),
            cycles_completed: AtomicUsize::new(0),
            cycles_skipped: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            saturation_started_at: Mutex::new(None),
            graceful_shutdown: AtomicBool::new(true),
            shutdown_timeout: Mutex::new(Duration::from_secs(30)),
        })
    }

    /// Opts this scheduler into re-reading `path` through the `Config`
    /// cache namespace once per `cache.config_ttl_secs`, applying the same
    /// live-safe subset of fields as [`Self::reconfigure`] (`spec.md` §6).
    pub fn watch_config_file(&self, path: PathBuf) {
        *self.config_path.lock() = Some(path);
    }

    /// Restore tracker state from disk before the first cycle, if a snapshot
    /// exists (`spec.md` §6).
    pub fn restore(&self) -> Result<(), crate::error::CoreError> {
        if let Some(snapshot) = self.persistence.load()? {
            for agent in snapshot.agents {
                self.tracker.load_agent(agent);
            }
            for (session, record) in snapshot.pm_records {
                self.tracker.set_pm_record(&session, record);
            }
            info!("restored tracker state from snapshot");
        }
        Ok(())
    }

    /// Runs the cycle loop until `stop` is called or the process is signaled.
    /// Mirrors the teacher's `run_loop` shape: an interval tick driving one
    /// cycle, cancellation checked on every tick (`spec.md` §4.10).
    pub async fn run(self: &Arc<Self>) {
        let sweeper = pool::spawn_sweeper(self.pool.clone(), self.cancel.clone());
        let drainer = self
            .notifications
            .spawn_drainer(self.pool.clone(), self.pm_targets.clone(), self.cancel.clone());

        let mut ticker = tokio::time::interval(self.config.read().cycle_interval());
        let persist_interval = Duration::from_secs(
            self.config.read().persistence.persist_interval_secs.max(1),
        );
        let mut persist_ticker = tokio::time::interval(persist_interval);
        persist_ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.run_one_cycle().await;
                }
                _ = persist_ticker.tick() => {
                    if let Err(e) = self.snapshot_now() {
                        warn!(error = %e, "periodic snapshot persist failed");
                    }
                }
            }
        }

        sweeper.abort();
        drainer.abort();

        if !self.graceful_shutdown.load(Ordering::SeqCst) {
            warn!("non-graceful shutdown: in-flight checks cancelled, skipping persistence");
            return;
        }

        let timeout = *self.shutdown_timeout.lock();
        let deadline = Instant::now() + timeout;
        while self.cycle_in_progress.load(Ordering::SeqCst) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        if self.cycle_in_progress.load(Ordering::SeqCst) {
            warn!("graceful shutdown timed out waiting for the in-flight cycle");
        }

        let pm_targets = self.pm_targets.lock().clone();
        self.notifications.drain_all(&self.pool, &pm_targets).await;

        if let Err(e) = self.snapshot_now() {
            warn!(error = %e, "failed to persist final snapshot on shutdown");
        }
    }

    /// Runs exactly one cycle, independent of the ticker in [`Self::run`].
    /// Used by integration tests and available for a future one-shot CLI
    /// mode.
    pub async fn run_once(self: &Arc<Self>) {
        self.run_one_cycle().await;
    }

    async fn run_one_cycle(self: &Arc<Self>) {
        if self
            .cycle_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let skipped = self.cycles_skipped.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(skipped, "previous cycle still running, skipping this tick");
            self.notifications.enqueue(Notification::new(
                Target::new("fleet", 0).expect("literal session name is always valid"),
                Severity::Warn,
                "cycle_overlap",
                format!("monitor cycle overlapped {skipped} time(s)"),
            ));
            return;
        }

        self.maybe_reload_config().await;
        self.maybe_relieve_saturation();

        let outcome = match self
            .discovery
            .discover(&self.pool, &self.session_cache, &self.role_cache)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "discovery pass failed, skipping cycle");
                self.cycle_in_progress.store(false, Ordering::SeqCst);
                return;
            }
        };
        self.tracker.warn_if_duplicate(outcome.duplicate_targets.len());

        let mut live = std::collections::HashSet::new();
        let mut pm_targets = std::collections::HashMap::new();
        for agent in &outcome.agents {
            self.tracker.observe_discovered(&agent.target, agent.role);
            live.insert(agent.target.clone());
            if agent.role.is_pm() {
                pm_targets.insert(agent.target.session().to_string(), agent.target.clone());
            }
        }
        *self.pm_targets.lock() = pm_targets;

        for agent in self.tracker.all_agents() {
            if !live.contains(&agent.target) {
                self.tracker.observe_missing(&agent.target);
            }
        }

        let checker = self.checker.lock().clone();
        let targets: Vec<Target> = outcome.agents.iter().map(|a| a.target.clone()).collect();
        let (strategy_name, max_parallel) = {
            let config = self.config.read();
            (config.strategy.clone(), config.max_parallel)
        };
        let strategy = StrategyRegistry::resolve(&strategy_name, max_parallel);
        let transitions = strategy.execute(&checker, &targets, &self.cancel).await;

        self.recovery.handle_transitions(&transitions).await;
        for t in &transitions {
            if t.role.is_pm() && t.to == AgentState::Active {
                self.recovery.confirm_healthy(t.target.session());
            }
        }

        self.cycles_completed.fetch_add(1, Ordering::SeqCst);
        self.cycle_in_progress.store(false, Ordering::SeqCst);
    }

    /// Halve `max_parallel` once the pool has been continuously saturated
    /// for `saturation_window_secs`, restoring it by doubling (capped at the
    /// originally configured value) once a full cycle passes unsaturated
    /// (`spec.md` §5 backpressure note).
    fn maybe_relieve_saturation(&self) {
        let saturated = self.pool.is_saturated();
        let mut since = self.saturation_started_at.lock();

        if !saturated {
            *since = None;
            let mut config = self.config.write();
            if config.max_parallel < self.configured_max_parallel {
                let restored = (config.max_parallel * 2).min(self.configured_max_parallel);
                info!(from = config.max_parallel, to = restored, "pool unsaturated for a full cycle, restoring concurrency");
                config.max_parallel = restored;
            }
            return;
        }

        let started_at = *since.get_or_insert_with(Instant::now);
        let elapsed = started_at.elapsed();
        let window = Duration::from_secs(self.config.read().saturation_window_secs);
        if elapsed < window {
            return;
        }

        let mut config = self.config.write();
        let floor = (config.max_parallel / 2).max(2);
        if floor < config.max_parallel {
            warn!(from = config.max_parallel, to = floor, elapsed_secs = elapsed.as_secs(), "pool saturated, halving concurrency");
            let from = config.max_parallel;
            config.max_parallel = floor;
            drop(config);
            self.notifications.enqueue(Notification::new(
                Target::new("fleet", 0).expect("literal session name is always valid"),
                Severity::Warn,
                "pool_saturation",
                format!("pool saturated for {}s, halved max_parallel from {from} to {floor}", elapsed.as_secs()),
            ));
        }
        // Restart the window so a still-saturated pool doesn't halve again
        // every single cycle.
        *since = Some(Instant::now());
    }

    /// Re-reads the watched config file (if any) through the `Config`
    /// namespace cache, applying the live-safe subset of fields on change.
    async fn maybe_reload_config(&self) {
        let path = self.config_path.lock().clone();
        let Some(path) = path else { return };
        let key = path.to_string_lossy().to_string();

        let loaded = self
            .config_cache
            .get_or_compute(Namespace::Config, key, || async {
                let text = std::fs::read_to_string(&path).map_err(crate::error::CoreError::Io)?;
                Config::from_toml_str(&text)
            })
            .await;

        match loaded {
            Ok(new_config) => {
                self.reconfigure(
                    Some(new_config.strategy),
                    Some(new_config.max_parallel),
                    Some(new_config.cycle_interval_secs),
                );
            }
            Err(e) => {
                warn!(error = %e, "failed to reload watched config file, keeping previous settings");
            }
        }
    }

    pub fn snapshot_now(&self) -> Result<(), crate::error::CoreError> {
        let agents: Vec<Agent> = self.tracker.all_agents();
        let pm_records = self.tracker.all_pm_records();
        self.persistence.save(&agents, &pm_records)
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            state: if self.cancel.is_cancelled() {
                SchedulerState::Stopped
            } else {
                SchedulerState::Running
            },
            cycles_completed: self.cycles_completed.load(Ordering::SeqCst) as u64,
            cycles_skipped: self.cycles_skipped.load(Ordering::SeqCst) as u64,
            pool: self.pool.stats(),
            agent_counts: self.tracker.counts_by_state(),
        }
    }

    /// Swaps in a new configuration for the parts that are safe to change
    /// live: cycle cadence, strategy choice, and concurrency. Pool/cache
    /// sizing requires a restart (`spec.md` §9, Open Questions).
    pub fn reconfigure(&self, strategy: Option<String>, max_parallel: Option<usize>, cycle_interval_secs: Option<u64>) {
        let mut config = self.config.write();
        if let Some(s) = strategy {
            config.strategy = s;
        }
        if let Some(m) = max_parallel {
            config.max_parallel = m;
        }
        if let Some(c) = cycle_interval_secs {
            config.cycle_interval_secs = c;
        }
    }

    /// Requests shutdown of the cycle loop driven by [`Self::run`].
    ///
    /// Non-graceful (`graceful = false`) cancels every in-flight check
    /// immediately (via the shared cancellation token) and skips
    /// persistence entirely. Graceful waits up to `timeout` for the current
    /// cycle to finish, then drains the notification queue and persists a
    /// final snapshot (`spec.md` §4.11, §5).
    pub fn stop(&self, graceful: bool, timeout: Duration) {
        self.graceful_shutdown.store(graceful, Ordering::SeqCst);
        *self.shutdown_timeout.lock() = timeout;
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn notifications(&self) -> &Arc<NotificationQueue> {
        &self.notifications
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Current live `max_parallel`, as mutated by [`Self::maybe_relieve_saturation`]
    /// and [`Self::reconfigure`].
    pub fn max_parallel(&self) -> usize {
        self.config.read().max_parallel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmux::mock::MockTmuxAdapter;

    #[tokio::test]
    async fn single_cycle_discovers_and_transitions() {
        let mock = Arc::new(MockTmuxAdapter::new());
        let target = Target::new("team", 0).unwrap();
        mock.add_target(target.clone(), vec!["booting".into(), "ready".into()]);

        let mut config = Config::default();
        config.recovery.grace_period_secs = 0;
        let scheduler = MonitorScheduler::new(config, {
            let mock = mock.clone();
            move || mock.clone()
        });

        scheduler.run_one_cycle().await;
        assert!(scheduler.tracker.get(&target).is_some());
        assert_eq!(scheduler.status().cycles_completed, 1);
    }

    #[tokio::test]
    async fn overlapping_cycle_is_skipped() {
        let mock = Arc::new(MockTmuxAdapter::new());
        let scheduler = MonitorScheduler::new(Config::default(), {
            let mock = mock.clone();
            move || mock.clone()
        });
        scheduler.cycle_in_progress.store(true, Ordering::SeqCst);
        scheduler.run_one_cycle().await;
        assert_eq!(scheduler.status().cycles_skipped, 1);
        assert_eq!(scheduler.status().cycles_completed, 0);
    }
}
