//! `NotificationQueue` (`spec.md` §4.7) — a bounded, deduplicated FIFO
//! drained by a single task to the PM (via `TmuxAdapter::send`) and the
//! structured log.
//!
//! Generalizes the teacher's `NotifyThrottle` (`src/throttle.rs`), which
//! merges/dedupes three hard-coded event kinds on fixed windows, into a
//! single dedup rule over the `(target, kind)` key the spec defines, with a
//! capacity-aware drop policy.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::model::{now_unix, Timestamp};
use crate::pool::ConnectionPool;
use crate::target::Target;
use crate::tmux::TmuxAdapter as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub target: Target,
    pub severity: Severity,
    pub kind: String,
    pub message: String,
    pub created_at: Timestamp,
    pub suppressed_count: u32,
}

impl Notification {
    pub fn new(target: Target, severity: Severity, kind: impl Into<String>, message: String) -> Self {
        Self {
            target,
            severity,
            kind: kind.into(),
            message,
            created_at: now_unix(),
            suppressed_count: 0,
        }
    }

    pub fn dedupe_key(&self) -> (Target, String) {
        (self.target.clone(), self.kind.clone())
    }
}

struct QueueState {
    items: VecDeque<Notification>,
    dedupe_index: HashMap<(Target, String), usize>,
    dropped: u64,
}

/// Bounded FIFO with `(target, kind)` dedup within `dedupe_window`
/// (`spec.md` §4.7, §8.4).
pub struct NotificationQueue {
    capacity: usize,
    dedupe_window: Duration,
    state: Mutex<QueueState>,
    notify: tokio::sync::Notify,
}

impl NotificationQueue {
    pub fn new(capacity: usize, dedupe_window: Duration) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            dedupe_window,
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                dedupe_index: HashMap::new(),
                dropped: 0,
            }),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Enqueue a notification, deduplicating against any live entry with the
    /// same `(target, kind)` within `dedupe_window`.
    pub fn enqueue(&self, notification: Notification) {
        let mut state = self.state.lock();
        let key = notification.dedupe_key();

        if let Some(&idx) = state.dedupe_index.get(&key) {
            if let Some(existing) = state.items.get_mut(idx) {
                let age = notification.created_at.saturating_sub(existing.created_at);
                if age <= self.dedupe_window.as_secs() {
                    existing.created_at = notification.created_at;
                    existing.suppressed_count += 1;
                    return;
                }
            }
        }

        if state.items.len() >= self.capacity {
            if !Self::make_room_for(&mut state, notification.severity) {
                state.dropped += 1;
                warn!(kind = %notification.kind, "notification queue full, dropping");
                return;
            }
        }

        state.items.push_back(notification);
        let idx = state.items.len() - 1;
        state.dedupe_index.insert(key, idx);
        self.reindex(&mut state);
        self.notify.notify_one();
    }

    /// When full: drop the current minimum-severity entry if the incoming
    /// notification outranks it; ties discard the oldest (`spec.md` §4.7).
    fn make_room_for(state: &mut QueueState, incoming: Severity) -> bool {
        let min_idx = state
            .items
            .iter()
            .enumerate()
            .min_by_key(|(_, n)| n.severity)
            .map(|(i, _)| i);

        match min_idx {
            // `min_by_key` returns the first (oldest) element on ties, which
            // is exactly the one spec.md says to discard on a tie.
            Some(idx) => {
                let min_sev = state.items[idx].severity;
                if incoming >= min_sev {
                    state.items.remove(idx);
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn reindex(&self, state: &mut QueueState) {
        state.dedupe_index.clear();
        for (i, n) in state.items.iter().enumerate() {
            state.dedupe_index.insert(n.dedupe_key(), i);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-only view of everything currently queued, oldest first. Used by
    /// `status` reporting and tests; does not drain.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.state.lock().items.iter().cloned().collect()
    }

    fn pop(&self) -> Option<Notification> {
        let mut state = self.state.lock();
        let n = state.items.pop_front();
        if n.is_some() {
            self.reindex(&mut state);
        }
        n
    }

    /// Drain everything currently queued, delivering each to the log and, for
    /// `severity >= WARN` notifications addressed to a PM, via the adapter.
    pub async fn drain_all(&self, pool: &Arc<ConnectionPool>, pm_targets: &HashMap<String, Target>) {
        while let Some(n) = self.pop() {
            self.deliver(&n, pool, pm_targets).await;
        }
    }

    async fn deliver(&self, n: &Notification, pool: &Arc<ConnectionPool>, pm_targets: &HashMap<String, Target>) {
        match n.severity {
            Severity::Info => info!(target = %n.target, kind = %n.kind, "{}", n.message),
            Severity::Warn => warn!(target = %n.target, kind = %n.kind, "{}", n.message),
            Severity::Error | Severity::Critical => {
                error!(target = %n.target, kind = %n.kind, "{}", n.message)
            }
        }

        if n.severity < Severity::Warn {
            return;
        }

        if let Some(pm_target) = pm_targets.get(n.target.session()) {
            if let Ok(guard) = pool.acquire().await {
                let text = format!("[{:?}] {}: {}", n.severity, n.kind, n.message);
                if let Err(e) = guard.adapter().send(pm_target, &text, true).await {
                    warn!(error = %e, "failed to deliver notification to PM");
                }
            }
        }
    }

    /// Spawns the single drainer task described in `spec.md` §4.7, running
    /// until `cancel` fires.
    pub fn spawn_drainer(
        self: &Arc<Self>,
        pool: Arc<ConnectionPool>,
        pm_targets: Arc<Mutex<HashMap<String, Target>>>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let targets = pm_targets.lock().clone();
                        queue.drain_all(&pool, &targets).await;
                        break;
                    }
                    _ = queue.notify.notified() => {
                        let targets = pm_targets.lock().clone();
                        queue.drain_all(&pool, &targets).await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::tmux::mock::MockTmuxAdapter;

    fn target(s: &str, w: u32) -> Target {
        Target::new(s, w).unwrap()
    }

    #[test]
    fn dedupes_within_window() {
        let q = NotificationQueue::new(10, Duration::from_secs(60));
        q.enqueue(Notification::new(target("a", 0), Severity::Warn, "stuck", "m1".into()));
        q.enqueue(Notification::new(target("a", 0), Severity::Warn, "stuck", "m2".into()));
        assert_eq!(q.len(), 1);
        let popped = q.pop().unwrap();
        assert_eq!(popped.suppressed_count, 1);
    }

    #[test]
    fn different_kinds_are_not_deduped() {
        let q = NotificationQueue::new(10, Duration::from_secs(60));
        q.enqueue(Notification::new(target("a", 0), Severity::Warn, "stuck", "m".into()));
        q.enqueue(Notification::new(target("a", 0), Severity::Warn, "crashed", "m".into()));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn full_queue_drops_lower_severity_in_favor_of_higher() {
        let q = NotificationQueue::new(2, Duration::from_secs(60));
        q.enqueue(Notification::new(target("a", 0), Severity::Info, "k1".to_string(), "m".into()));
        q.enqueue(Notification::new(target("b", 0), Severity::Info, "k2".to_string(), "m".into()));
        q.enqueue(Notification::new(target("c", 0), Severity::Critical, "k3".to_string(), "m".into()));
        assert_eq!(q.len(), 2);
        let kinds: Vec<String> = q.state.lock().items.iter().map(|n| n.kind.clone()).collect();
        assert!(kinds.contains(&"k3".to_string()));
    }

    #[test]
    fn full_queue_drops_incoming_when_not_higher_severity() {
        let q = NotificationQueue::new(1, Duration::from_secs(60));
        q.enqueue(Notification::new(target("a", 0), Severity::Critical, "k1".to_string(), "m".into()));
        q.enqueue(Notification::new(target("b", 0), Severity::Info, "k2".to_string(), "m".into()));
        assert_eq!(q.len(), 1);
        assert_eq!(q.dropped_count(), 1);
    }

    #[tokio::test]
    async fn drain_delivers_warn_and_above_to_pm_via_adapter() {
        let q = NotificationQueue::new(10, Duration::from_secs(60));
        let mock = Arc::new(MockTmuxAdapter::new());
        let pool = ConnectionPool::new(PoolConfig::default(), {
            let mock = mock.clone();
            move || mock.clone()
        });

        let pm = target("team", 0);
        let mut pm_targets = HashMap::new();
        pm_targets.insert("team".to_string(), pm.clone());

        q.enqueue(Notification::new(target("team", 1), Severity::Warn, "stuck", "help".into()));
        q.enqueue(Notification::new(target("team", 1), Severity::Info, "fyi", "noop".into()));
        q.drain_all(&pool, &pm_targets).await;

        let sent = mock.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, pm);
    }
}
