use dashmap::DashMap;
use dashmap::mapref::entry::Entry as MapEntry;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::trace;

/// Default sweep interval for background expiry.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Key → value map where every entry expires `live_for` after insertion.
///
/// `get` lazily deletes an expired entry on access; a background sweeper
/// removes the rest so memory does not grow with abandoned keys. The sweeper
/// holds only a `Weak` reference — dropping the last `Arc<TimedCache>` ends
/// the task.
pub struct TimedCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    live_for: Duration,
}

impl<K, V> TimedCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(live_for: Duration) -> Arc<Self> {
        Arc::new(Self { entries: DashMap::new(), live_for })
    }

    /// Create a cache and start its background sweeper on the current
    /// tokio runtime.
    pub fn with_sweeper(live_for: Duration, every: Duration) -> Arc<Self> {
        let cache = Self::new(live_for);
        cache.spawn_sweeper(every);
        cache
    }

    fn expired(&self, entry: &Entry<V>) -> bool {
        entry.inserted.elapsed() >= self.live_for
    }

    /// Live value for `key`, deleting it first if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(occupied) => {
                if self.expired(occupied.get()) {
                    occupied.remove();
                    None
                } else {
                    Some(occupied.get().value.clone())
                }
            }
            MapEntry::Vacant(_) => None,
        }
    }

    pub fn has(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .map(|entry| !self.expired(&entry))
            .unwrap_or(false)
    }

    /// Insert or replace, resetting the entry's lifetime.
    pub fn set(&self, key: K, value: V) {
        self.entries.insert(key, Entry { value, inserted: Instant::now() });
    }

    /// Replace the value only if a live entry already exists. Atomic with
    /// respect to concurrent `get`/`set` on the same key.
    pub fn set_if_present(&self, key: K, value: V) -> bool {
        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if self.expired(occupied.get()) {
                    occupied.remove();
                    false
                } else {
                    occupied.insert(Entry { value, inserted: Instant::now() });
                    true
                }
            }
            MapEntry::Vacant(_) => false,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(_, entry)| entry.value)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !self.expired(entry.value()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all live entries.
    pub fn entries(&self) -> Vec<(K, V)> {
        self.entries
            .iter()
            .filter(|entry| !self.expired(entry.value()))
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect()
    }

    /// Drop every expired entry.
    pub fn sweep(&self) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.inserted.elapsed() < self.live_for);
        let removed = before - self.entries.len();
        if removed > 0 {
            trace!(removed, "Swept expired cache entries");
        }
    }

    /// Start the periodic sweeper. The task stops once the cache itself is
    /// dropped, so it never keeps the process alive on its own.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => cache.sweep(),
                    None => break,
                }
            }
        });
    }
}
