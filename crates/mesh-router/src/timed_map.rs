//! Time-bounded map with generation rotation.
//!
//! Entries live in two buckets, `young` and `old`. A background task
//! promotes `young` to `old` every `period` and drops the previous `old`,
//! so an entry stored at time `t` is readable until at least `t + period`
//! and unreadable after `t + 2 * period`. A `load` hit in `old` promotes
//! the entry back into `young`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

struct Generations<K, V> {
    young: HashMap<K, V>,
    old: HashMap<K, V>,
}

/// Bounded-lifetime `key -> value` mapping.
///
/// All operations are concurrency-safe and total. Dropping the map stops
/// its rotation task.
pub struct TimedMap<K, V> {
    inner: Arc<Mutex<Generations<K, V>>>,
    size: usize,
}

impl<K, V> TimedMap<K, V>
where
    K: Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
{
    /// Create a map whose entries expire between `period` and `2 * period`.
    ///
    /// `size` is a capacity hint for the young bucket. Must be called
    /// within a tokio runtime.
    pub fn new(period: Duration, size: usize) -> Self {
        let inner = Arc::new(Mutex::new(Generations {
            young: HashMap::with_capacity(size),
            old: HashMap::new(),
        }));

        let weak: Weak<Mutex<Generations<K, V>>> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so the first
            // rotation happens one full period after construction.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let mut gens = inner.lock();
                gens.old = std::mem::replace(&mut gens.young, HashMap::with_capacity(size));
            }
        });

        Self { inner, size }
    }

    /// Store a value, overwriting any young entry and shadowing any old one.
    pub fn store(&self, key: K, value: V) {
        self.inner.lock().young.insert(key, value);
    }

    /// Load a value. A hit in the old generation is promoted into young.
    pub fn load(&self, key: &K) -> Option<V>
    where
        K: Clone,
    {
        let mut gens = self.inner.lock();
        if let Some(v) = gens.young.get(key) {
            return Some(v.clone());
        }
        if let Some(v) = gens.old.remove(key) {
            gens.young.insert(key.clone(), v.clone());
            return Some(v);
        }
        None
    }

    /// Store `value` unless the key is already live; returns the existing
    /// value if there was one. A hit in the old generation is promoted.
    pub fn load_or_store(&self, key: K, value: V) -> Option<V> {
        let mut gens = self.inner.lock();
        if let Some(v) = gens.young.get(&key) {
            return Some(v.clone());
        }
        if let Some(v) = gens.old.remove(&key) {
            gens.young.insert(key, v.clone());
            return Some(v);
        }
        gens.young.insert(key, value);
        None
    }

    /// Remove a key from both generations.
    pub fn delete(&self, key: &K) {
        let mut gens = self.inner.lock();
        gens.young.remove(key);
        gens.old.remove(key);
    }

    /// Number of live entries across both generations.
    pub fn len(&self) -> usize {
        let gens = self.inner.lock();
        gens.young.len() + gens.old.len()
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity hint this map was built with.
    pub fn size_hint(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_load_within_period() {
        let m: TimedMap<String, String> = TimedMap::new(Duration::from_millis(200), 3);
        m.store("key".into(), "value".into());

        assert_eq!(m.load(&"key".into()), Some("value".into()));
    }

    #[tokio::test]
    async fn test_expires_after_two_periods() {
        let m: TimedMap<String, String> = TimedMap::new(Duration::from_millis(100), 3);
        m.store("key".into(), "value".into());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(m.load(&"key".into()), None);
    }

    #[tokio::test]
    async fn test_load_promotes_old_entry() {
        let m: TimedMap<String, String> = TimedMap::new(Duration::from_millis(150), 3);
        m.store("key".into(), "value".into());

        // One rotation: the entry is now in the old generation. Loading it
        // must promote it, keeping it alive for another generation.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(m.load(&"key".into()), Some("value".into()));

        tokio::time::sleep(Duration::from_millis(160)).await;
        assert_eq!(m.load(&"key".into()), Some("value".into()));
    }

    #[tokio::test]
    async fn test_delete() {
        let m: TimedMap<String, u32> = TimedMap::new(Duration::from_millis(100), 3);
        m.store("key".into(), 1);
        m.delete(&"key".into());

        assert_eq!(m.load(&"key".into()), None);
        assert!(m.is_empty());
    }
}
