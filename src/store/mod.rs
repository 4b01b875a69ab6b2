//! Storage backends and the expiring key-value layer built on top of them.
//!
//! - [`KeyValueStore`] - raw string storage shared by every context of an origin
//! - [`MemoryStore`] - in-process backend that also publishes change notifications
//! - [`FileStore`] - one JSON file per key, shareable between processes
//! - [`ExpiringStore`] - TTL-aware typed access scoped to one provider/client pair
//! - [`StorageWatcher`] - change notifications produced by *other* contexts

pub mod file;
pub mod memory;
pub mod watcher;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use watcher::{PollingWatcher, StorageChange, StorageChanges, StorageWatcher};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::Result;

/// Default lifetime of an entry written without an explicit expiry (1 year).
pub const DEFAULT_TTL_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Current time as Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// =============================================================================
// KeyValueStore trait
// =============================================================================

/// Raw string storage.
///
/// All implementations must be thread-safe (`Send + Sync`). Keys are full
/// storage keys; scoping by provider/client happens in [`ExpiringStore`].
pub trait KeyValueStore: Send + Sync {
    /// Read the raw value stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Every key currently stored.
    fn keys(&self) -> Result<Vec<String>>;

    /// Get the name of this storage backend.
    fn name(&self) -> &str;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
    fn keys(&self) -> Result<Vec<String>> {
        (**self).keys()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Box<T> {
    fn get(&self, key: &str) -> Result<Option<String>> {
        (**self).get(key)
    }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }
    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }
    fn keys(&self) -> Result<Vec<String>> {
        (**self).keys()
    }
    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// StoredValue
// =============================================================================

/// Serialized unit of every [`ExpiringStore`] entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredValue<T> {
    /// Absolute expiry, Unix milliseconds.
    pub expire_in: i64,
    pub value: T,
}

impl<T> StoredValue<T> {
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expire_in
    }
}

impl<T: DeserializeOwned> StoredValue<T> {
    /// Parse a raw entry, returning `None` if it is corrupt or expired at `now`.
    pub fn parse_live(raw: &str, now: i64) -> Option<Self> {
        serde_json::from_str::<Self>(raw)
            .ok()
            .filter(|stored| !stored.is_expired_at(now))
    }
}

// =============================================================================
// ExpiringStore
// =============================================================================

/// Typed key-value cache with per-entry expiry.
///
/// Keys are built with [`Config::store_key`], so two provider/client pairs
/// sharing one backend never see each other's entries. Reads treat expired
/// and corrupt entries as absent and evict them.
#[derive(Clone)]
pub struct ExpiringStore {
    backend: Arc<dyn KeyValueStore>,
    config: Arc<Config>,
}

impl ExpiringStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    /// Full storage key for a postfix.
    pub fn key(&self, postfix: &str) -> String {
        self.config.store_key(postfix)
    }

    pub fn backend(&self) -> &Arc<dyn KeyValueStore> {
        &self.backend
    }

    /// Store `value` until `expire_in` (Unix ms), or for [`DEFAULT_TTL_MS`].
    #[instrument(skip(self, value))]
    pub fn set<T: Serialize>(
        &self,
        postfix: &str,
        value: &T,
        expire_in: Option<i64>,
    ) -> Result<()> {
        let stored = StoredValue {
            expire_in: expire_in.unwrap_or_else(|| now_millis() + DEFAULT_TTL_MS),
            value,
        };
        let raw = serde_json::to_string(&stored)?;
        self.backend.set(&self.key(postfix), &raw)
    }

    /// Read a live entry. Expired or unparsable entries are evicted and reported as absent.
    #[instrument(skip(self))]
    pub fn get<T: DeserializeOwned>(&self, postfix: &str) -> Option<StoredValue<T>> {
        let key = self.key(postfix);
        let raw = match self.backend.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, error = %e, "Failed to read store entry");
                return None;
            }
        };

        match serde_json::from_str::<StoredValue<T>>(&raw) {
            Ok(stored) if !stored.is_expired_at(now_millis()) => Some(stored),
            Ok(_) => {
                debug!(%key, "Store entry expired");
                self.evict(&key);
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "Corrupt store entry");
                self.evict(&key);
                None
            }
        }
    }

    /// Convenience for [`get`](Self::get) returning only the value.
    pub fn get_value<T: DeserializeOwned>(&self, postfix: &str) -> Option<T> {
        self.get(postfix).map(|stored| stored.value)
    }

    #[instrument(skip(self))]
    pub fn remove(&self, postfix: &str) -> Result<()> {
        self.backend.remove(&self.key(postfix))
    }

    /// Evict every expired or corrupt entry under the configured prefix.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> Result<usize> {
        let now = now_millis();
        let prefix = &self.config.store_key_prefix;
        let mut removed = 0;

        for key in self.backend.keys()? {
            if !key.starts_with(prefix.as_str()) {
                continue;
            }
            let live = match self.backend.get(&key) {
                Ok(Some(raw)) => is_live_entry(&raw, now),
                Ok(None) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "Failed to read entry during sweep");
                    false
                }
            };
            if !live {
                self.evict(&key);
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "Swept expired store entries");
        }
        Ok(removed)
    }

    fn evict(&self, key: &str) {
        if let Err(e) = self.backend.remove(key) {
            warn!(%key, error = %e, "Failed to evict store entry");
        }
    }
}

/// True if `raw` is a well-formed entry that has not expired at `now`.
fn is_live_entry(raw: &str, now: i64) -> bool {
    StoredValue::<serde_json::Value>::parse_live(raw, now).is_some()
}
