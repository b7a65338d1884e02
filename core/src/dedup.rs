//! TTL-bounded in-memory registries.
//!
//! Three pipeline facilities sit on these: per-message-id idempotency, the
//! recently-created-issue fingerprint map, and the matcher's search cache.
//! Contention is trivial, so a coarse mutex per registry is enough; entries
//! expire lazily on access and are purged opportunistically on insert.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

/// Set of keys that expire `ttl` after insertion.
pub struct TtlSet<K> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash> TtlSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `key`, returning `true` if it was not already present and
    /// unexpired. This is the check-and-insert used for replay rejection.
    pub fn insert(&self, key: K) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("ttl set lock");
        entries.retain(|_, inserted| now.duration_since(*inserted) < self.ttl);
        match entries.get(&key) {
            Some(_) => false,
            None => {
                entries.insert(key, now);
                true
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let now = Instant::now();
        let entries = self.entries.lock().expect("ttl set lock");
        entries
            .get(key)
            .is_some_and(|inserted| now.duration_since(*inserted) < self.ttl)
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().expect("ttl set lock");
        entries
            .values()
            .filter(|inserted| now.duration_since(**inserted) < self.ttl)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a key early, before its TTL elapses.
    pub fn remove(&self, key: &K) {
        self.entries.lock().expect("ttl set lock").remove(key);
    }
}

/// Map whose values expire `ttl` after insertion.
pub struct TtlMap<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V: Clone> TtlMap<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("ttl map lock");
        entries.retain(|_, (_, inserted)| now.duration_since(*inserted) < self.ttl);
        entries.insert(key, (value, now));
    }

    /// Fetch an unexpired value. Expiry is measured from insertion; reads do
    /// not refresh it.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let entries = self.entries.lock().expect("ttl map lock");
        entries.get(key).and_then(|(value, inserted)| {
            (now.duration_since(*inserted) < self.ttl).then(|| value.clone())
        })
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().expect("ttl map lock");
        entries.remove(key).map(|(value, _)| value)
    }

    pub fn clear(&self) {
        self.entries.lock().expect("ttl map lock").clear();
    }
}
