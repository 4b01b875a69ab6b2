//! Directory-backed storage, one file per key.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use super::KeyValueStore;
use crate::error::{OidcError, Result};

/// File permissions for entry files (Unix only): owner read/write.
#[cfg(unix)]
const FILE_MODE: u32 = 0o600;

/// Directory permissions (Unix only): owner read/write/execute.
#[cfg(unix)]
const DIR_MODE: u32 = 0o700;

const ENTRY_EXTENSION: &str = "json";

/// On-disk form of one entry. The file name is a digest, so the key is kept
/// alongside the value.
#[derive(Serialize, Deserialize)]
struct FileEntry {
    key: String,
    value: String,
}

/// File-based key-value storage.
///
/// Each key is stored in `{dir}/{base64url(sha256(key))}.json`, so keys of
/// any length or content map to short portable file names. Several processes
/// can share one directory; pair it with a
/// [`PollingWatcher`](super::PollingWatcher) to observe each other's writes.
///
/// # Security
/// - File permissions are set to 0600 (owner read/write only) on Unix
/// - The directory is created with 0700 permissions
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory where entries are stored.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let digest = URL_SAFE_NO_PAD.encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{digest}.{ENTRY_EXTENSION}"))
    }

    fn read_entry(path: &Path) -> Result<Option<FileEntry>> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).map(Some).map_err(|e| {
                OidcError::Storage(format!("Corrupt entry file '{}': {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(OidcError::Storage(format!(
                "Failed to read entry file '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    /// Ensure the storage directory exists with correct permissions.
    fn ensure_dir(&self) -> Result<()> {
        if self.dir.exists() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            OidcError::Storage(format!(
                "Failed to create store directory '{}': {}",
                self.dir.display(),
                e
            ))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(DIR_MODE);
            std::fs::set_permissions(&self.dir, perms).map_err(|e| {
                OidcError::Storage(format!(
                    "Failed to set directory permissions on '{}': {}",
                    self.dir.display(),
                    e
                ))
            })?;
        }
        debug!(dir = %self.dir.display(), "Created store directory");
        Ok(())
    }

    fn write_temp(temp_path: &Path, value: &str) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(FILE_MODE)
                .open(temp_path)?;
            file.write_all(value.as_bytes())?;
            file.sync_all()
        }

        #[cfg(not(unix))]
        {
            std::fs::write(temp_path, value)
        }
    }
}

impl KeyValueStore for FileStore {
    #[instrument(skip(self))]
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entry = Self::read_entry(&self.entry_path(key))?;
        Ok(entry.filter(|entry| entry.key == key).map(|entry| entry.value))
    }

    #[instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_dir()?;

        let path = self.entry_path(key);
        // Unique temp name: another process may be writing the same key.
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let content = serde_json::to_string(&FileEntry {
            key: key.to_string(),
            value: value.to_string(),
        })?;

        if let Err(e) = Self::write_temp(&temp_path, &content) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(OidcError::Storage(format!(
                "Failed to write temp file '{}': {}",
                temp_path.display(),
                e
            )));
        }

        if let Err(e) = std::fs::rename(&temp_path, &path) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(OidcError::Storage(format!(
                "Failed to rename '{}' to '{}': {}",
                temp_path.display(),
                path.display(),
                e
            )));
        }

        Ok(())
    }

    #[instrument(skip(self))]
    fn remove(&self, key: &str) -> Result<()> {
        let path = self.entry_path(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(OidcError::Storage(format!(
                "Failed to remove entry file '{}': {}",
                path.display(),
                e
            ))),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(OidcError::Storage(format!(
                    "Failed to list store directory '{}': {}",
                    self.dir.display(),
                    e
                )));
            }
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != ENTRY_EXTENSION) {
                continue;
            }
            match Self::read_entry(&path) {
                Ok(Some(entry)) => keys.push(entry.key),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable entry file"),
            }
        }
        Ok(keys)
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "OIDC-MIF:access_token:https://idp.example.com/realms/a:spa";

    #[test]
    fn test_file_set_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.get(KEY).unwrap().is_none());

        store.set(KEY, r#"{"expireIn":1,"value":"tok"}"#).unwrap();
        assert_eq!(
            store.get(KEY).unwrap().as_deref(),
            Some(r#"{"expireIn":1,"value":"tok"}"#)
        );
        assert_eq!(store.name(), "file");
    }

    #[test]
    fn test_file_overwrite_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.set(KEY, "one").unwrap();
        store.set(KEY, "two").unwrap();
        assert_eq!(store.get(KEY).unwrap().as_deref(), Some("two"));

        store.remove(KEY).unwrap();
        assert!(store.get(KEY).unwrap().is_none());
        store.remove(KEY).unwrap();
    }

    #[test]
    fn test_file_keys_round_trip_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        store.set(KEY, "a").unwrap();
        store.set("OIDC-MIF:refreshLock", "b").unwrap();
        std::fs::write(dir.path().join("stray.txt"), "ignored").unwrap();

        let mut keys = store.keys().unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![KEY.to_string(), "OIDC-MIF:refreshLock".to_string()]
        );
    }

    #[test]
    fn test_file_long_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let key = format!(
            "OIDC-MIF:refresh_token:https://idp.example.com/realms/{}:{}",
            "r".repeat(120),
            "c".repeat(120)
        );

        store.set(&key, "long").unwrap();
        assert_eq!(store.get(&key).unwrap().as_deref(), Some("long"));
        assert_eq!(store.keys().unwrap(), vec![key.clone()]);

        store.remove(&key).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[test]
    fn test_file_skips_foreign_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        store.set(KEY, "v").unwrap();
        std::fs::write(dir.path().join("notes.json"), "[1, 2]").unwrap();

        assert_eq!(store.keys().unwrap(), vec![KEY.to_string()]);
    }

    #[test]
    fn test_file_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("not-yet"));
        assert!(store.keys().unwrap().is_empty());
        assert!(store.get(KEY).unwrap().is_none());
    }

    #[test]
    fn test_file_creates_nested_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let store = FileStore::new(&nested);
        store.set(KEY, "v").unwrap();
        assert!(nested.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("store");
        let store = FileStore::new(&nested);
        store.set(KEY, "v").unwrap();

        let file_mode = std::fs::metadata(store.entry_path(KEY))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(file_mode & 0o777, 0o600);

        let dir_mode = std::fs::metadata(&nested).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }
}
