//! Storage backends
//!
//! Raw string key/value persistence. [`MemoryBackend`] is used for tests and
//! simulated profiles, [`FileBackend`] keeps a profile on disk for the CLI.

use crate::{ClientError, ClientResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Raw key/value persistence
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> ClientResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> ClientResult<()>;
    fn remove(&self, key: &str) -> ClientResult<()>;
    fn keys(&self) -> ClientResult<Vec<String>>;
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> ClientResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> ClientResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// File backend: the whole profile lives in one JSON document
pub struct FileBackend {
    /// Path of the profile file
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
}

impl FileBackend {
    /// Open (or create) the profile file inside `storage_dir`
    pub fn open<P: AsRef<Path>>(storage_dir: P) -> ClientResult<Self> {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        // Create storage directory if it doesn't exist
        std::fs::create_dir_all(&storage_dir).map_err(ClientError::Io)?;

        let path = storage_dir.join("profile.json");
        let entries = if path.exists() {
            let json_data = std::fs::read_to_string(&path).map_err(ClientError::Io)?;
            match serde_json::from_str::<HashMap<String, String>>(&json_data) {
                Ok(entries) => entries,
                Err(e) => {
                    // A corrupt profile is treated as empty rather than fatal
                    warn!("Discarding unreadable profile {}: {}", path.display(), e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        info!(
            "Profile storage initialized at: {} ({} keys)",
            path.display(),
            entries.len()
        );

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, entries: &HashMap<String, String>) -> ClientResult<()> {
        let json_data =
            serde_json::to_string_pretty(entries).map_err(ClientError::Serialization)?;
        std::fs::write(&self.path, json_data).map_err(|e| {
            ClientError::storage(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        debug!("Flushed profile to {}", self.path.display());
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> ClientResult<()> {
        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.to_string());
        self.flush(&entries)
    }

    fn remove(&self, key: &str) -> ClientResult<()> {
        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> ClientResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_backend_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let backend = FileBackend::open(dir.path()).unwrap();
            backend.set("a", "1").unwrap();
            backend.set("b", "2").unwrap();
            backend.remove("b").unwrap();
        }

        let reopened = FileBackend::open(dir.path()).unwrap();
        assert_eq!(reopened.get("a").unwrap(), Some("1".to_string()));
        assert_eq!(reopened.get("b").unwrap(), None);
        assert_eq!(reopened.keys().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_failed_flush_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::open(dir.path()).unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();

        let err = backend.set("a", "1").unwrap_err();
        assert!(matches!(err, ClientError::Storage { .. }));
        assert!(err.to_string().contains("profile.json"));
    }

    #[test]
    fn test_file_backend_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("profile.json"), "{not json").unwrap();

        let backend = FileBackend::open(dir.path()).unwrap();
        assert!(backend.keys().unwrap().is_empty());
    }
}
