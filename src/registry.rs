//! Bounded connection registries.
//!
//! Each protocol adapter keeps its live connections in a [`Registry`]: a
//! mutex-guarded map from endpoint key to entry, with a hard capacity bound.
//! Capacity exhaustion fails fast, it never blocks, and there is no eviction:
//! entries live until closed explicitly.
//!
//! Entries are wrapped in `Arc<tokio::sync::Mutex<_>>` so a worker can
//! reserve one with a short registry lock, then perform socket I/O holding
//! only the entry's own async lock.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub type Entry<V> = Arc<tokio::sync::Mutex<V>>;

pub struct Registry<K, V> {
    name: &'static str,
    capacity: usize,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self { name, capacity, entries: Mutex::new(HashMap::new()) }
    }

    pub fn find(&self, key: &K) -> Option<Entry<V>> {
        self.entries.lock().get(key).cloned()
    }

    /// Insert a fresh entry, failing fast when the registry is full or the
    /// key is already present.
    pub fn create(&self, key: K, value: V) -> Result<Entry<V>> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&key) {
            return Err(Error::InvalidArgument(format!(
                "{} registry already holds this endpoint",
                self.name
            )));
        }
        if entries.len() >= self.capacity {
            return Err(Error::CapacityExceeded(format!(
                "{} registry is full ({} entries)",
                self.name, self.capacity
            )));
        }
        let entry = Arc::new(tokio::sync::Mutex::new(value));
        entries.insert(key, Arc::clone(&entry));
        Ok(entry)
    }

    /// Find an entry or create it with `init`, atomically under the registry
    /// lock. The lock is held only for the map operation, never while the
    /// entry's value is used.
    pub fn find_or_create(&self, key: &K, init: impl FnOnce() -> V) -> Result<Entry<V>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(key) {
            return Ok(Arc::clone(entry));
        }
        if entries.len() >= self.capacity {
            return Err(Error::CapacityExceeded(format!(
                "{} registry is full ({} entries)",
                self.name, self.capacity
            )));
        }
        let entry = Arc::new(tokio::sync::Mutex::new(init()));
        entries.insert(key.clone(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Remove an entry. Idempotent: removing an absent key is a no-op.
    /// Dropping the returned `Arc` releases the transport handle it owns.
    pub fn remove(&self, key: &K) -> Option<Entry<V>> {
        self.entries.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_fails_fast() {
        let reg: Registry<u32, &str> = Registry::new("test", 2);
        reg.create(1, "a").unwrap();
        reg.create(2, "b").unwrap();
        let err = reg.create(3, "c").unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(_)));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_idempotent() {
        let reg: Registry<u32, &str> = Registry::new("test", 4);
        reg.create(1, "a").unwrap();
        assert!(reg.remove(&1).is_some());
        assert!(reg.remove(&1).is_none());
        assert!(reg.is_empty());
    }

    #[tokio::test]
    async fn test_find_or_create_reuses() {
        let reg: Registry<String, u32> = Registry::new("test", 4);
        let a = reg.find_or_create(&"k".to_string(), || 7).unwrap();
        let b = reg.find_or_create(&"k".to_string(), || 99).unwrap();
        assert_eq!(*b.lock().await, 7);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
