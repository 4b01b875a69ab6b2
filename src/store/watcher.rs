//! Change notifications for storage shared between client instances.
//!
//! A [`StorageWatcher`] is the only way one context learns that another
//! context changed shared storage. [`MemoryStore`](super::MemoryStore) pushes
//! notifications as writes happen; [`PollingWatcher`] wraps any backend
//! (typically a [`FileStore`](super::FileStore) shared by processes) and
//! discovers foreign writes by diffing snapshots.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{instrument, warn};

use super::KeyValueStore;
use crate::error::Result;
use crate::task::ScheduledTask;

/// Origin stamped on changes discovered by polling.
const EXTERNAL_ORIGIN: u64 = u64::MAX;

/// One observed mutation of a storage key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    /// Handle that made the change.
    pub origin: u64,
}

/// Source of storage change notifications.
pub trait StorageWatcher: Send + Sync {
    /// Subscribe to changes made by other contexts.
    fn watch(&self) -> StorageChanges;
}

/// Stream of changes made by other handles.
#[derive(Debug)]
pub struct StorageChanges {
    rx: broadcast::Receiver<StorageChange>,
    local_origin: Option<u64>,
}

impl StorageChanges {
    pub fn new(rx: broadcast::Receiver<StorageChange>, local_origin: Option<u64>) -> Self {
        Self { rx, local_origin }
    }

    /// Wait for the next foreign change. `None` once the source is gone.
    pub async fn next(&mut self) -> Option<StorageChange> {
        loop {
            match self.rx.recv().await {
                Ok(change) if Some(change.origin) == self.local_origin => continue,
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage change notifications dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// =============================================================================
// PollingWatcher
// =============================================================================

struct PollState<S> {
    inner: S,
    prefix: String,
    snapshot: Mutex<HashMap<String, String>>,
    changes: broadcast::Sender<StorageChange>,
}

impl<S: KeyValueStore> PollState<S> {
    fn lock_snapshot(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_prefixed(&self) -> Result<HashMap<String, String>> {
        let mut current = HashMap::new();
        for key in self.inner.keys()? {
            if !key.starts_with(self.prefix.as_str()) {
                continue;
            }
            if let Some(value) = self.inner.get(&key)? {
                current.insert(key, value);
            }
        }
        Ok(current)
    }

    /// Diff the backend against the last snapshot and publish differences.
    fn poll(&self) -> Result<usize> {
        let mut snapshot = self.lock_snapshot();
        let current = self.read_prefixed()?;
        let mut published = 0;

        for (key, value) in &current {
            let old = snapshot.get(key);
            if old != Some(value) {
                self.publish(key.clone(), old.cloned(), Some(value.clone()));
                published += 1;
            }
        }
        for (key, old) in snapshot.iter() {
            if !current.contains_key(key) {
                self.publish(key.clone(), Some(old.clone()), None);
                published += 1;
            }
        }

        *snapshot = current;
        Ok(published)
    }

    fn publish(&self, key: String, old_value: Option<String>, new_value: Option<String>) {
        let _ = self.changes.send(StorageChange {
            key,
            old_value,
            new_value,
            origin: EXTERNAL_ORIGIN,
        });
    }
}

/// Wraps a backend and reports writes made to it by anyone else.
///
/// Writes that go through the watcher itself update the snapshot in place,
/// so only foreign writes show up as changes. Polling stops when the watcher
/// is dropped.
pub struct PollingWatcher<S> {
    state: Arc<PollState<S>>,
    _task: ScheduledTask,
}

impl<S: KeyValueStore + 'static> PollingWatcher<S> {
    /// Snapshot `inner` and start polling keys under `prefix` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(inner: S, prefix: impl Into<String>, interval: Duration) -> Result<Self> {
        let (changes, _) = broadcast::channel(256);
        let state = Arc::new(PollState {
            inner,
            prefix: prefix.into(),
            snapshot: Mutex::new(HashMap::new()),
            changes,
        });
        *state.lock_snapshot() = state.read_prefixed()?;

        let poll_state = Arc::clone(&state);
        let task = ScheduledTask::every("storage-poll", interval, interval, move || {
            let state = Arc::clone(&poll_state);
            async move {
                if let Err(e) = state.poll() {
                    warn!(error = %e, "Storage poll failed");
                }
            }
        });

        Ok(Self { state, _task: task })
    }

    /// Run one poll immediately, returning the number of changes published.
    pub fn poll_now(&self) -> Result<usize> {
        self.state.poll()
    }
}

impl<S: KeyValueStore> KeyValueStore for PollingWatcher<S> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.state.inner.get(key)
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut snapshot = self.state.lock_snapshot();
        self.state.inner.set(key, value)?;
        if key.starts_with(self.state.prefix.as_str()) {
            snapshot.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<()> {
        let mut snapshot = self.state.lock_snapshot();
        self.state.inner.remove(key)?;
        snapshot.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        self.state.inner.keys()
    }

    fn name(&self) -> &str {
        self.state.inner.name()
    }
}

impl<S: KeyValueStore> StorageWatcher for PollingWatcher<S> {
    fn watch(&self) -> StorageChanges {
        StorageChanges::new(self.state.changes.subscribe(), None)
    }
}
