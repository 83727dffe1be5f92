//! `LayeredCache` (`spec.md` §4.3) — namespaced key-value cache with
//! per-namespace TTL, bounded size (LRU eviction at capacity), and
//! single-flight get-or-compute.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::config::CacheConfig;

/// The four required namespaces (`spec.md` §4.3), used as a typed key rather
/// than a loose string so a typo can't silently create a fifth namespace
/// with no TTL policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    PaneContent,
    AgentStatus,
    SessionInfo,
    Config,
}

impl Namespace {
    fn ttl(self, config: &CacheConfig) -> Duration {
        let secs = match self {
            Namespace::PaneContent => config.pane_content_ttl_secs,
            Namespace::AgentStatus => config.agent_status_ttl_secs,
            Namespace::SessionInfo => config.session_info_ttl_secs,
            Namespace::Config => config.config_ttl_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct NamespaceHitStats {
    pub hits: u64,
    pub misses: u64,
}

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: Instant,
}

struct NamespaceStore<K, V> {
    entries: HashMap<K, Entry<V>>,
    in_flight: HashMap<K, Arc<broadcast::Sender<()>>>,
    stats: NamespaceHitStats,
}

impl<K: Eq + Hash + Clone, V: Clone> Default for NamespaceStore<K, V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            in_flight: HashMap::new(),
            stats: NamespaceHitStats::default(),
        }
    }
}

/// A cache keyed by `(Namespace, K)` with independent TTL/LRU per namespace,
/// and single-flight get-or-compute so a cache miss triggers exactly one
/// concurrent computation per key (`spec.md` §8.3).
pub struct LayeredCache<K, V> {
    config: CacheConfig,
    namespaces: Mutex<HashMap<Namespace, NamespaceStore<K, V>>>,
}

impl<K, V> LayeredCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, ns: Namespace, key: &K) -> Option<V> {
        let mut namespaces = self.namespaces.lock();
        let store = namespaces.entry(ns).or_default();
        let ttl = ns.ttl(&self.config);
        let now = Instant::now();

        let is_live = store
            .entries
            .get(key)
            .map(|e| now.duration_since(e.inserted_at) <= ttl)
            .unwrap_or(false);

        if !is_live {
            store.entries.remove(key);
            store.stats.misses += 1;
            return None;
        }

        let entry = store.entries.get_mut(key).expect("checked live above");
        entry.last_used = now;
        store.stats.hits += 1;
        Some(entry.value.clone())
    }

    pub fn put(&self, ns: Namespace, key: K, value: V) {
        let mut namespaces = self.namespaces.lock();
        let store = namespaces.entry(ns).or_default();
        let now = Instant::now();
        store.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_used: now,
            },
        );
        Self::evict_if_over_capacity(store, self.config.max_entries_per_namespace);
    }

    fn evict_if_over_capacity(store: &mut NamespaceStore<K, V>, max: usize) {
        while store.entries.len() > max {
            let lru_key = store
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(k) = lru_key {
                store.entries.remove(&k);
            } else {
                break;
            }
        }
    }

    pub fn stats(&self, ns: Namespace) -> NamespaceHitStats {
        self.namespaces
            .lock()
            .get(&ns)
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    /// Get-or-compute with single-flight semantics: only one caller per key
    /// runs `compute`; the rest wait for its result.
    pub async fn get_or_compute<F, Fut, E>(&self, ns: Namespace, key: K, compute: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(ns, &key) {
            return Ok(v);
        }

        // Register (or join) the in-flight computation for this key under
        // the namespace lock so registration itself is atomic.
        let (is_leader, mut rx) = {
            let mut namespaces = self.namespaces.lock();
            let store = namespaces.entry(ns).or_default();
            if let Some(tx) = store.in_flight.get(&key) {
                (false, tx.subscribe())
            } else {
                let (tx, rx) = broadcast::channel(1);
                store.in_flight.insert(key.clone(), Arc::new(tx));
                (true, rx)
            }
        };

        if !is_leader {
            let _ = rx.recv().await;
            // The leader populated the cache (or failed, in which case we
            // fall through and the caller sees a fresh miss via `get`).
            if let Some(v) = self.get(ns, &key) {
                return Ok(v);
            }
            // Leader failed; callers besides the leader have no error value
            // to propagate, so they recompute themselves rather than hang.
        }

        let result = compute().await;
        {
            let mut namespaces = self.namespaces.lock();
            let store = namespaces.entry(ns).or_default();
            if let Ok(v) = &result {
                let now = Instant::now();
                store.entries.insert(
                    key.clone(),
                    Entry {
                        value: v.clone(),
                        inserted_at: now,
                        last_used: now,
                    },
                );
                Self::evict_if_over_capacity(store, self.config.max_entries_per_namespace);
            }
            if let Some(tx) = store.in_flight.remove(&key) {
                let _ = tx.send(());
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn put_then_get_within_ttl() {
        let cache: LayeredCache<String, i32> = LayeredCache::new(CacheConfig::default());
        cache.put(Namespace::Config, "k".into(), 42);
        assert_eq!(cache.get(Namespace::Config, &"k".to_string()), Some(42));
    }

    #[test]
    fn expires_after_ttl() {
        let mut config = CacheConfig::default();
        config.pane_content_ttl_secs = 0;
        let cache: LayeredCache<String, i32> = LayeredCache::new(config);
        cache.put(Namespace::PaneContent, "k".into(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get(Namespace::PaneContent, &"k".to_string()), None);
    }

    #[test]
    fn evicts_lru_at_capacity() {
        let mut config = CacheConfig::default();
        config.max_entries_per_namespace = 2;
        let cache: LayeredCache<String, i32> = LayeredCache::new(config);
        cache.put(Namespace::Config, "a".into(), 1);
        cache.put(Namespace::Config, "b".into(), 2);
        // touch "a" so "b" becomes the LRU entry
        let _ = cache.get(Namespace::Config, &"a".to_string());
        cache.put(Namespace::Config, "c".into(), 3);
        assert_eq!(cache.get(Namespace::Config, &"a".to_string()), Some(1));
        assert_eq!(cache.get(Namespace::Config, &"b".to_string()), None);
        assert_eq!(cache.get(Namespace::Config, &"c".to_string()), Some(3));
    }

    #[tokio::test]
    async fn get_or_compute_is_single_flight() {
        let cache: Arc<LayeredCache<String, i32>> = Arc::new(LayeredCache::new(CacheConfig::default()));
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(Namespace::AgentStatus, "k".to_string(), || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<i32, ()>(7)
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), Ok(7));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
