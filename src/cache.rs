//! Aged Cache
//!
//! Small bounded map used by the hash map (hot buckets) and the tree set
//! (nodes). Advisory only: owners write through to storage first and either
//! update or drop the cached copy, so losing an entry never loses data.
//!
//! ## Eviction
//! Every hit raises an entry's age. When an insert finds the cache full, every
//! age is lowered by the current minimum and the entries that reach zero are
//! dropped. Recently and frequently used entries survive; cold ones go first.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug)]
struct Slot<V> {
    value: V,
    age: u32,
}

/// Bounded cache with age counters
#[derive(Debug)]
pub struct AgedCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Slot<V>>,
    hits: u64,
    misses: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> AgedCache<K, V> {
    /// A capacity of zero disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a copy, ageing the entry on a hit
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get_mut(key) {
            Some(slot) => {
                slot.age = slot.age.saturating_add(1);
                self.hits += 1;
                Some(slot.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Peek without touching the age
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Insert or replace; replacing keeps the existing age
    pub fn insert(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }
        if let Some(slot) = self.entries.get_mut(&key) {
            slot.value = value;
            return;
        }
        if self.entries.len() >= self.capacity {
            self.evict();
        }
        self.entries.insert(key, Slot { value, age: 1 });
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// (hits, misses) since creation
    pub fn hit_stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    /// Cached keys, in no particular order
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    fn evict(&mut self) {
        let floor = self.entries.values().map(|slot| slot.age).min().unwrap_or(0);
        let before = self.entries.len();
        self.entries.retain(|_, slot| {
            slot.age -= floor;
            slot.age > 0
        });
        tracing::trace!(
            "cache eviction dropped {} of {} entries",
            before - self.entries.len(),
            before
        );
    }
}
