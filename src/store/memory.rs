//! In-memory storage shared by every handle attached to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::broadcast;
use tracing::instrument;

use super::KeyValueStore;
use super::watcher::{StorageChange, StorageChanges, StorageWatcher};
use crate::error::Result;

/// Buffered change notifications per subscriber before it starts lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct Shared {
    entries: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
    next_origin: AtomicU64,
}

/// In-memory key-value storage.
///
/// Uses `Arc<RwLock<HashMap>>` for thread-safe access. `clone()` returns the
/// same handle; [`attach`](Self::attach) returns a *new* handle on the same
/// entries, which is how several client instances model tabs of one origin.
/// Every mutation is published to watchers of the other handles.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create a new empty MemoryStore.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                changes,
                next_origin: AtomicU64::new(1),
            }),
            origin: 0,
        }
    }

    /// A new handle on the same entries with its own change origin.
    pub fn attach(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            origin: self.shared.next_origin.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Identifier stamped on changes made through this handle.
    pub fn origin(&self) -> u64 {
        self.origin
    }

    /// Get the number of stored entries.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    /// Check if storage is empty.
    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    /// Remove every entry, notifying watchers once per key.
    pub fn clear(&self) {
        let drained: Vec<(String, String)> = {
            let mut guard = self
                .shared
                .entries
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            guard.drain().collect()
        };
        for (key, old) in drained {
            self.publish(key, Some(old), None);
        }
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, String>> {
        self.shared
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, key: String, old_value: Option<String>, new_value: Option<String>) {
        // No subscribers is fine.
        let _ = self.shared.changes.send(StorageChange {
            key,
            old_value,
            new_value,
            origin: self.origin,
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_entries().get(key).cloned())
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut guard = self
            .shared
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let old = guard.insert(key.to_string(), value.to_string());
        if old.as_deref() != Some(value) {
            self.publish(key.to_string(), old, Some(value.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self
            .shared
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(old) = guard.remove(key) {
            self.publish(key.to_string(), Some(old), None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.read_entries().keys().cloned().collect())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

impl StorageWatcher for MemoryStore {
    fn watch(&self) -> StorageChanges {
        StorageChanges::new(self.shared.changes.subscribe(), Some(self.origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_memory_new_is_empty() {
        let store = MemoryStore::new();
        assert!(store.get("k").unwrap().is_none());
        assert!(store.is_empty());
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_memory_set_get_remove() {
        let store = MemoryStore::new();
        store.set("k", "v1").unwrap();
        store.set("k", "v2").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(store.len(), 1);

        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
        store.remove("k").unwrap();
    }

    #[test]
    fn test_attached_handles_share_entries() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.attach();
        assert_ne!(tab_a.origin(), tab_b.origin());

        tab_a.set("k", "v").unwrap();
        assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));
        assert_eq!(tab_b.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_clone_keeps_origin() {
        let store = MemoryStore::new();
        assert_eq!(store.clone().origin(), store.origin());
    }

    #[tokio::test]
    async fn test_watch_reports_other_handles_only() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.attach();
        let mut changes = tab_b.watch();

        tab_b.set("own", "ignored").unwrap();
        tab_a.set("k", "v").unwrap();
        tab_a.set("k", "v").unwrap();
        tab_a.remove("k").unwrap();

        let first = changes.next().await.unwrap();
        assert_eq!(first.key, "k");
        assert_eq!(first.old_value, None);
        assert_eq!(first.new_value.as_deref(), Some("v"));

        let second = changes.next().await.unwrap();
        assert_eq!(second.old_value.as_deref(), Some("v"));
        assert_eq!(second.new_value, None);

        let none = tokio::time::timeout(Duration::from_millis(50), changes.next()).await;
        assert!(none.is_err(), "unchanged write must not notify");
    }

    #[tokio::test]
    async fn test_clear_notifies_each_key() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.attach();
        let mut changes = tab_b.watch();

        tab_a.set("a", "1").unwrap();
        tab_a.set("b", "2").unwrap();
        tab_a.clear();
        assert!(tab_b.is_empty());

        let mut removed = Vec::new();
        for _ in 0..4 {
            let change = changes.next().await.unwrap();
            if change.new_value.is_none() {
                removed.push(change.key);
            }
        }
        removed.sort();
        assert_eq!(removed, vec!["a".to_string(), "b".to_string()]);
    }
}
