use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: AtomicU64,
}

/// Bounded multi-reader map with LRU eviction and per-entry TTL.
///
/// Lookups take the read lock only; recency is tracked through an atomic
/// tick so concurrent readers never serialize on each other. When an insert
/// pushes the map past capacity, expired entries go first, then the
/// least-recently-used entries until the size is back at the eviction
/// target (`ceil(capacity * eviction_ratio)`).
pub struct BoundedTtlCache<K, V> {
    inner: RwLock<HashMap<K, Entry<V>>>,
    tick: AtomicU64,
    capacity: usize,
    evict_target: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> BoundedTtlCache<K, V> {
    pub fn new(capacity: usize, eviction_ratio: f64, ttl: Duration) -> Self {
        let capacity = capacity.max(1);
        let target = ((capacity as f64) * eviction_ratio).ceil() as usize;
        Self {
            inner: RwLock::new(HashMap::new()),
            tick: AtomicU64::new(0),
            capacity,
            evict_target: target.clamp(1, capacity),
            ttl,
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Returns a clone of the cached value, or None on miss or TTL expiry.
    pub fn get(&self, key: &K) -> Option<V> {
        let map = self.inner.read().unwrap();
        let entry = map.get(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        entry.last_used.store(self.next_tick(), Ordering::Relaxed);
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut map = self.inner.write().unwrap();
        map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: AtomicU64::new(self.next_tick()),
            },
        );
        if map.len() > self.capacity {
            Self::evict(&mut map, self.ttl, self.evict_target);
        }
    }

    fn evict(map: &mut HashMap<K, Entry<V>>, ttl: Duration, target: usize) {
        map.retain(|_, e| e.inserted_at.elapsed() < ttl);
        if map.len() <= target {
            return;
        }
        let mut order: Vec<(u64, K)> = map
            .iter()
            .map(|(k, e)| (e.last_used.load(Ordering::Relaxed), k.clone()))
            .collect();
        order.sort_unstable_by_key(|(tick, _)| *tick);
        let excess = map.len() - target;
        for (_, key) in order.into_iter().take(excess) {
            map.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
