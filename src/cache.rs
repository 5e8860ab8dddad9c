//! Shared LRU cache for segment-index handles.
//!
//! Sized once at engine open; a zero capacity is a configuration error. A
//! periodic background pass prunes the cache so retired segments do not pin
//! memory between lookups.

use std::{borrow::Borrow, collections::BTreeMap, collections::HashMap, hash::Hash};

use parking_lot::Mutex;

struct LruState<K, V> {
    entries: HashMap<K, (u64, V)>,
    /// Recency index: tick -> key. Ticks are unique.
    order: BTreeMap<u64, K>,
    tick: u64,
    capacity: usize,
}

/// A mutex-guarded LRU map.
pub struct LruCache<K, V> {
    state: Mutex<LruState<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Cache holding at most `capacity` entries. `capacity` must be nonzero;
    /// the engine validates this at open.
    pub fn new(capacity: usize) -> Self {
        LruCache {
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                tick: 0,
                capacity,
            }),
        }
    }

    /// Look up a value, refreshing its recency.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.entries.get_mut(key)?;
        let old_tick = std::mem::replace(&mut entry.0, tick);
        let value = entry.1.clone();
        let key = state
            .order
            .remove(&old_tick)
            .expect("recency index entry must exist for a cached key");
        state.order.insert(tick, key);
        Some(value)
    }

    /// Insert a value, evicting the least recently used entry when full.
    pub fn insert(&self, key: K, value: V) {
        let mut state = self.state.lock();
        state.tick += 1;
        let tick = state.tick;
        if let Some((old_tick, _)) = state.entries.remove(&key) {
            state.order.remove(&old_tick);
        } else if state.entries.len() >= state.capacity {
            if let Some((_, evicted)) = state.order.pop_first() {
                state.entries.remove(&evicted);
            }
        }
        state.order.insert(tick, key.clone());
        state.entries.insert(key, (tick, value));
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Drop every entry, returning how many were held.
    pub fn prune(&self) -> usize {
        let mut state = self.state.lock();
        let pruned = state.entries.len();
        state.entries.clear();
        state.order.clear();
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" is the eviction candidate.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn reinsert_updates_value_without_growth() {
        let cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("a", 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn prune_empties_the_cache() {
        let cache = LruCache::new(8);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.prune(), 2);
        assert!(cache.is_empty());
    }
}
