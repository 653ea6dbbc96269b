//! Bounded TTL key-value cache
//!
//! Holds short-lived, loss-tolerant state (live participant snapshots,
//! extension activity) that must not live in process globals. Entries expire
//! after a fixed TTL; when the cache is full the oldest write is evicted.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Slot<V> {
    value: V,
    written_at: Instant,
}

/// Thread-safe TTL cache with a hard size bound
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    max_entries: usize,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose entries live for `ttl` and which never holds more than `max_entries`
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &K, at: Instant) -> Option<V> {
        let slots = self.lock();
        slots
            .get(key)
            .filter(|slot| at.saturating_duration_since(slot.written_at) < self.ttl)
            .map(|slot| slot.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        self.put_at(key, value, Instant::now());
    }

    pub fn put_at(&self, key: K, value: V, at: Instant) {
        let mut slots = self.lock();

        if !slots.contains_key(&key) && slots.len() >= self.max_entries {
            let oldest = slots
                .iter()
                .min_by_key(|(_, slot)| slot.written_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                slots.remove(&oldest);
            }
        }

        slots.insert(
            key,
            Slot {
                value,
                written_at: at,
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.lock().remove(key).map(|slot| slot.value)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, at: Instant) -> usize {
        let mut slots = self.lock();
        let before = slots.len();
        slots.retain(|_, slot| at.saturating_duration_since(slot.written_at) < self.ttl);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Slot<V>>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
