//! Browser runtime model
//!
//! A [`BrowserProfile`] owns what its tabs share: the durable key/value store
//! and, when the environment supports it, a hub of named publish/subscribe
//! channels. A [`TabEnvironment`] owns what is private to one tab: its
//! session-scoped store, its in-page event bus and its stream of focus,
//! visibility and input signals.

use crate::fingerprint::{DeviceFingerprint, EnvironmentSignals};
use crate::store::{LocalStore, SharedStore, StorageBackend};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 128;

/// Identifier of one tab
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    pub fn new() -> Self {
        Self(format!("tab_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for TabId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kinds of user input that count as activity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pointer,
    Keyboard,
    Scroll,
    Touch,
}

/// Window-level signals delivered to a tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentEvent {
    Focus,
    Blur,
    VisibilityChanged { visible: bool },
    Input(InputKind),
}

impl EnvironmentEvent {
    /// Whether the tab just became the one the user is looking at
    pub fn is_focus_regain(&self) -> bool {
        matches!(
            self,
            EnvironmentEvent::Focus | EnvironmentEvent::VisibilityChanged { visible: true }
        )
    }
}

/// Synchronous event dispatched inside one tab
#[derive(Debug, Clone, PartialEq)]
pub struct PageEvent {
    pub name: String,
    pub detail: serde_json::Value,
}

/// Message posted on a named channel
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub origin: TabId,
    pub payload: serde_json::Value,
}

/// Registry of named publish/subscribe channels for one profile
#[derive(Default)]
pub struct ChannelHub {
    channels: Mutex<HashMap<String, broadcast::Sender<ChannelMessage>>>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name` on behalf of `tab`
    pub fn open(&self, name: &str, tab: TabId) -> NamedChannel {
        let sender = self
            .channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_BUFFER).0)
            .clone();

        NamedChannel {
            name: name.to_string(),
            sender,
            tab,
        }
    }
}

/// One tab's endpoint on a named channel.
///
/// Like a browser broadcast channel, a message is delivered to every other
/// endpoint but not back to the one that posted it.
#[derive(Clone)]
pub struct NamedChannel {
    name: String,
    sender: broadcast::Sender<ChannelMessage>,
    tab: TabId,
}

impl NamedChannel {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post to every other endpoint; returns how many endpoints were listening
    pub fn post(&self, payload: serde_json::Value) -> usize {
        self.sender
            .send(ChannelMessage {
                origin: self.tab.clone(),
                payload,
            })
            .unwrap_or(0)
    }

    pub fn subscribe(&self) -> ChannelSubscription {
        ChannelSubscription {
            receiver: self.sender.subscribe(),
            own_tab: self.tab.clone(),
        }
    }
}

/// Messages posted by other endpoints
pub struct ChannelSubscription {
    receiver: broadcast::Receiver<ChannelMessage>,
    own_tab: TabId,
}

impl ChannelSubscription {
    pub async fn recv(&mut self) -> Option<ChannelMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if message.origin == self.own_tab => continue,
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Channel subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// What a browser profile shares across its tabs
#[derive(Clone)]
pub struct BrowserProfile {
    durable: Arc<SharedStore>,
    hub: Option<Arc<ChannelHub>>,
}

impl BrowserProfile {
    /// Profile backed by memory, with channel support
    pub fn in_memory() -> Self {
        Self {
            durable: SharedStore::in_memory(),
            hub: Some(Arc::new(ChannelHub::new())),
        }
    }

    /// Profile over an existing backend, with channel support
    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            durable: SharedStore::new(backend),
            hub: Some(Arc::new(ChannelHub::new())),
        }
    }

    /// Same profile as seen by an environment without named channels
    pub fn without_channels(&self) -> Self {
        Self {
            durable: Arc::clone(&self.durable),
            hub: None,
        }
    }

    pub fn durable_store(&self) -> &Arc<SharedStore> {
        &self.durable
    }

    /// Open a new tab on this profile
    pub fn open_tab(&self, signals: EnvironmentSignals) -> TabEnvironment {
        let id = TabId::new();
        let (environment, _) = broadcast::channel(EVENT_BUFFER);
        let (page, _) = broadcast::channel(EVENT_BUFFER);
        let fingerprint = DeviceFingerprint::from_signals(&signals);

        debug!(tab = %id, fingerprint = %fingerprint, "Opened tab");

        TabEnvironment {
            durable: self.durable.handle(id.clone()),
            session: SharedStore::in_memory().handle(id.clone()),
            hub: self.hub.clone(),
            id,
            signals,
            fingerprint,
            environment,
            page,
        }
    }
}

/// Everything one tab can reach
#[derive(Clone)]
pub struct TabEnvironment {
    id: TabId,
    signals: EnvironmentSignals,
    fingerprint: DeviceFingerprint,
    durable: LocalStore,
    session: LocalStore,
    hub: Option<Arc<ChannelHub>>,
    environment: broadcast::Sender<EnvironmentEvent>,
    page: broadcast::Sender<PageEvent>,
}

impl TabEnvironment {
    pub fn id(&self) -> &TabId {
        &self.id
    }

    pub fn signals(&self) -> &EnvironmentSignals {
        &self.signals
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    /// Profile-wide durable store
    pub fn durable_store(&self) -> &LocalStore {
        &self.durable
    }

    /// Store cleared with the browsing session, private to this tab
    pub fn session_store(&self) -> &LocalStore {
        &self.session
    }

    /// Named channel endpoint, if the environment supports channels
    pub fn channel(&self, name: &str) -> Option<NamedChannel> {
        self.hub
            .as_ref()
            .map(|hub| hub.open(name, self.id.clone()))
    }

    /// Deliver a window-level signal to this tab
    pub fn dispatch(&self, event: EnvironmentEvent) {
        let _ = self.environment.send(event);
    }

    pub fn environment_events(&self) -> broadcast::Receiver<EnvironmentEvent> {
        self.environment.subscribe()
    }

    /// Dispatch an in-page event to this tab's listeners
    pub fn dispatch_page_event(&self, name: &str, detail: serde_json::Value) -> usize {
        self.page
            .send(PageEvent {
                name: name.to_string(),
                detail,
            })
            .unwrap_or(0)
    }

    pub fn page_events(&self) -> broadcast::Receiver<PageEvent> {
        self.page.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channel_skips_poster() {
        let profile = BrowserProfile::in_memory();
        let tab_a = profile.open_tab(EnvironmentSignals::default());
        let tab_b = profile.open_tab(EnvironmentSignals::default());

        let a = tab_a.channel("updates").unwrap();
        let b = tab_b.channel("updates").unwrap();
        let mut a_sub = a.subscribe();
        let mut b_sub = b.subscribe();

        assert_eq!(a.post(serde_json::json!({"n": 1})), 2);

        let received = b_sub.recv().await.unwrap();
        assert_eq!(received.payload["n"], 1);
        assert_eq!(&received.origin, tab_a.id());

        let own = tokio::time::timeout(Duration::from_millis(20), a_sub.recv()).await;
        assert!(own.is_err());
    }

    #[test]
    fn test_profile_without_channels() {
        let profile = BrowserProfile::in_memory().without_channels();
        let tab = profile.open_tab(EnvironmentSignals::default());
        assert!(tab.channel("updates").is_none());
    }

    #[test]
    fn test_session_store_is_private_to_tab() {
        let profile = BrowserProfile::in_memory();
        let tab_a = profile.open_tab(EnvironmentSignals::default());
        let tab_b = profile.open_tab(EnvironmentSignals::default());

        tab_a.session_store().set_raw("k", "v").unwrap();
        tab_a.durable_store().set_raw("shared", "v").unwrap();

        assert_eq!(tab_b.session_store().get_raw("k").unwrap(), None);
        assert_eq!(
            tab_b.durable_store().get_raw("shared").unwrap(),
            Some("v".to_string())
        );
        assert_eq!(tab_a.fingerprint(), tab_b.fingerprint());
    }
}
