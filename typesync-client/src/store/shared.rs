//! Cross-tab shared store
//!
//! Every write through a [`LocalStore`] is applied to the profile's backend and
//! announced to the other tabs of the profile, the same way a browser fires
//! `storage` events in every tab except the one that wrote.

use super::backend::{MemoryBackend, StorageBackend};
use crate::runtime::TabId;
use crate::ClientResult;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Capacity of the change notification channel
const CHANGE_BUFFER: usize = 256;

/// A key written or removed by some tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageChange {
    pub key: String,
    /// New raw value; `None` when the key was removed
    pub new_value: Option<String>,
    pub origin: TabId,
}

/// Profile-wide store shared by all tabs
pub struct SharedStore {
    backend: Arc<dyn StorageBackend>,
    changes: broadcast::Sender<StorageChange>,
}

impl SharedStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Arc::new(Self { backend, changes })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Handle for one tab
    pub fn handle(self: &Arc<Self>, tab: TabId) -> LocalStore {
        LocalStore {
            shared: Arc::clone(self),
            tab,
        }
    }
}

/// One tab's view of a [`SharedStore`]
#[derive(Clone)]
pub struct LocalStore {
    shared: Arc<SharedStore>,
    tab: TabId,
}

impl LocalStore {
    pub fn tab(&self) -> &TabId {
        &self.tab
    }

    pub fn get_raw(&self, key: &str) -> ClientResult<Option<String>> {
        self.shared.backend.get(key)
    }

    pub fn set_raw(&self, key: &str, value: &str) -> ClientResult<()> {
        self.shared.backend.set(key, value)?;
        self.announce(key, Some(value.to_string()));
        Ok(())
    }

    pub fn remove_raw(&self, key: &str) -> ClientResult<()> {
        self.shared.backend.remove(key)?;
        self.announce(key, None);
        Ok(())
    }

    pub fn keys(&self) -> ClientResult<Vec<String>> {
        self.shared.backend.keys()
    }

    /// Changes made by other tabs
    pub fn changes(&self) -> StorageChanges {
        StorageChanges {
            receiver: self.shared.changes.subscribe(),
            own_tab: self.tab.clone(),
        }
    }

    fn announce(&self, key: &str, new_value: Option<String>) {
        // No receivers is the common case for a single tab
        let _ = self.shared.changes.send(StorageChange {
            key: key.to_string(),
            new_value,
            origin: self.tab.clone(),
        });
    }
}

/// Stream of changes written by other tabs
pub struct StorageChanges {
    receiver: broadcast::Receiver<StorageChange>,
    own_tab: TabId,
}

impl StorageChanges {
    /// Next change from another tab; `None` once the store is gone
    pub async fn recv(&mut self) -> Option<StorageChange> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.origin == self.own_tab => continue,
                Ok(change) => return Some(change),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Storage change listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Storage change channel closed");
                    return None;
                }
            }
        }
    }

    /// Next change to `key` from another tab
    pub async fn recv_key(&mut self, key: &str) -> Option<StorageChange> {
        loop {
            let change = self.recv().await?;
            if change.key == key {
                return Some(change);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writer_does_not_observe_own_write() {
        let shared = SharedStore::in_memory();
        let tab_a = shared.handle(TabId::new());
        let tab_b = shared.handle(TabId::new());

        let mut a_changes = tab_a.changes();
        let mut b_changes = tab_b.changes();

        tab_a.set_raw("k", "v").unwrap();

        let seen_by_b = b_changes.recv().await.unwrap();
        assert_eq!(seen_by_b.key, "k");
        assert_eq!(seen_by_b.new_value.as_deref(), Some("v"));
        assert_eq!(&seen_by_b.origin, tab_a.tab());

        let own = tokio::time::timeout(std::time::Duration::from_millis(20), a_changes.recv()).await;
        assert!(own.is_err(), "writer must not see its own change");

        // Both handles read the same backend
        assert_eq!(tab_b.get_raw("k").unwrap(), Some("v".to_string()));
    }
}
