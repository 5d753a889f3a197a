//! Entitlement transports
//!
//! Every way a tab can learn about an entitlement change sits behind
//! [`EntitlementTransport`]. Subscribing spawns a listener that forwards
//! triggers into the bus; the bus owns the returned handle.

use super::signal::{BusTrigger, EntitlementSignal};
use crate::runtime::{NamedChannel, TabEnvironment};
use crate::store::{keys, LocalStore};
use crate::{ClientError, ClientResult};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// In-page event name carrying entitlement updates
pub const PAGE_EVENT_NAME: &str = "typesync:entitlement-updated";

pub type TriggerSender = mpsc::UnboundedSender<BusTrigger>;

/// One delivery mechanism for entitlement triggers
pub trait EntitlementTransport: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this transport carries published signals at all
    fn publishes(&self) -> bool {
        true
    }

    fn publish(&self, signal: &EntitlementSignal) -> ClientResult<()>;

    /// Start forwarding triggers into `triggers`
    fn subscribe(&self, triggers: TriggerSender) -> ClientResult<JoinHandle<()>>;
}

/// Which transports a tab wires up besides polling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSelection {
    pub storage_signal: bool,
    pub broadcast_channel: bool,
    pub in_page: bool,
}

impl TransportSelection {
    pub fn all() -> Self {
        Self {
            storage_signal: true,
            broadcast_channel: true,
            in_page: true,
        }
    }

    /// Nothing but the periodic poll
    pub fn poll_only() -> Self {
        Self {
            storage_signal: false,
            broadcast_channel: false,
            in_page: false,
        }
    }
}

impl Default for TransportSelection {
    fn default() -> Self {
        Self::all()
    }
}

/// Shared storage key; observed by every tab except the writer
pub struct StorageSignalTransport {
    store: LocalStore,
}

impl StorageSignalTransport {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }
}

impl EntitlementTransport for StorageSignalTransport {
    fn name(&self) -> &'static str {
        "storage"
    }

    fn publish(&self, signal: &EntitlementSignal) -> ClientResult<()> {
        self.store
            .set_raw(keys::ENTITLEMENT_SIGNAL, &signal.to_json().to_string())
            .map_err(|e| ClientError::entitlement(format!("Signal key not written: {}", e)))
    }

    fn subscribe(&self, triggers: TriggerSender) -> ClientResult<JoinHandle<()>> {
        let mut changes = self.store.changes();
        let name = self.name();

        Ok(tokio::spawn(async move {
            while let Some(change) = changes.recv_key(keys::ENTITLEMENT_SIGNAL).await {
                let Some(raw) = change.new_value else { continue };
                let Ok(signal) = serde_json::from_str::<EntitlementSignal>(&raw) else {
                    debug!(transport = name, "Ignoring malformed entitlement signal");
                    continue;
                };
                if triggers
                    .send(BusTrigger::Signal {
                        transport: name,
                        signal,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }))
    }
}

/// Named publish/subscribe channel shared by the profile's tabs
pub struct BroadcastChannelTransport {
    channel: NamedChannel,
}

impl BroadcastChannelTransport {
    /// `None` when the tab's environment has no channel support
    pub fn open(tab: &TabEnvironment, channel_name: &str) -> Option<Self> {
        tab.channel(channel_name).map(|channel| Self { channel })
    }
}

impl EntitlementTransport for BroadcastChannelTransport {
    fn name(&self) -> &'static str {
        "broadcast-channel"
    }

    fn publish(&self, signal: &EntitlementSignal) -> ClientResult<()> {
        let listeners = self.channel.post(signal.to_json());
        trace!(channel = self.channel.name(), listeners, "Posted entitlement signal");
        Ok(())
    }

    fn subscribe(&self, triggers: TriggerSender) -> ClientResult<JoinHandle<()>> {
        let mut subscription = self.channel.subscribe();
        let name = self.name();

        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                let Some(signal) = EntitlementSignal::from_json(message.payload) else {
                    debug!(transport = name, "Ignoring malformed channel message");
                    continue;
                };
                if triggers
                    .send(BusTrigger::Signal {
                        transport: name,
                        signal,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }))
    }
}

/// In-page event; reaches listeners of the writing tab itself
pub struct InPageTransport {
    tab: TabEnvironment,
}

impl InPageTransport {
    pub fn new(tab: TabEnvironment) -> Self {
        Self { tab }
    }
}

impl EntitlementTransport for InPageTransport {
    fn name(&self) -> &'static str {
        "in-page"
    }

    fn publish(&self, signal: &EntitlementSignal) -> ClientResult<()> {
        self.tab.dispatch_page_event(PAGE_EVENT_NAME, signal.to_json());
        Ok(())
    }

    fn subscribe(&self, triggers: TriggerSender) -> ClientResult<JoinHandle<()>> {
        let mut events = self.tab.page_events();
        let name = self.name();

        Ok(tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                if event.name != PAGE_EVENT_NAME {
                    continue;
                }
                let Some(signal) = EntitlementSignal::from_json(event.detail) else {
                    continue;
                };
                if triggers
                    .send(BusTrigger::Signal {
                        transport: name,
                        signal,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }))
    }
}

/// Fixed-interval poll; the first tick comes one full period after subscribing
pub struct PollTransport {
    period: Duration,
}

impl PollTransport {
    pub fn new(period: Duration) -> ClientResult<Self> {
        if period.is_zero() {
            return Err(ClientError::validation("Poll interval must be positive"));
        }
        Ok(Self { period })
    }
}

impl EntitlementTransport for PollTransport {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn publishes(&self) -> bool {
        false
    }

    fn publish(&self, _signal: &EntitlementSignal) -> ClientResult<()> {
        Ok(())
    }

    fn subscribe(&self, triggers: TriggerSender) -> ClientResult<JoinHandle<()>> {
        let period = self.period;

        Ok(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                trace!("Entitlement poll tick");
                if triggers.send(BusTrigger::PollTick).is_err() {
                    break;
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::EnvironmentSignals;
    use crate::runtime::BrowserProfile;
    use chrono::Utc;
    use typesync_core::SubscriptionTier;

    fn signal() -> EntitlementSignal {
        EntitlementSignal {
            tier: SubscriptionTier::Premium,
            timestamp: Utc::now(),
            user_id: "u1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_storage_signal_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = crate::store::FileBackend::open(dir.path()).unwrap();
        std::fs::remove_dir_all(dir.path()).unwrap();
        let profile = BrowserProfile::with_backend(std::sync::Arc::new(backend));
        let tab = profile.open_tab(EnvironmentSignals::default());

        let transport = StorageSignalTransport::new(tab.durable_store().clone());
        let err = transport.publish(&signal()).unwrap_err();
        assert!(matches!(err, ClientError::Entitlement { .. }));
    }

    #[tokio::test]
    async fn test_storage_signal_reaches_other_tab_only() {
        let profile = BrowserProfile::in_memory();
        let tab_a = profile.open_tab(EnvironmentSignals::default());
        let tab_b = profile.open_tab(EnvironmentSignals::default());

        let a = StorageSignalTransport::new(tab_a.durable_store().clone());
        let b = StorageSignalTransport::new(tab_b.durable_store().clone());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let _a_task = a.subscribe(a_tx).unwrap();
        let _b_task = b.subscribe(b_tx).unwrap();

        a.publish(&signal()).unwrap();

        match b_rx.recv().await.unwrap() {
            BusTrigger::Signal { transport, signal } => {
                assert_eq!(transport, "storage");
                assert_eq!(signal.user_id, "u1");
                assert_eq!(signal.tier, SubscriptionTier::Premium);
            }
            other => panic!("unexpected trigger: {other:?}"),
        }
        let own = tokio::time::timeout(Duration::from_millis(20), a_rx.recv()).await;
        assert!(own.is_err());
    }

    #[tokio::test]
    async fn test_in_page_reaches_writer() {
        let profile = BrowserProfile::in_memory();
        let tab = profile.open_tab(EnvironmentSignals::default());
        let transport = InPageTransport::new(tab.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = transport.subscribe(tx).unwrap();

        transport.publish(&signal()).unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            BusTrigger::Signal { transport: "in-page", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_skips_immediate_tick() {
        let transport = PollTransport::new(Duration::from_secs(45)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _task = transport.subscribe(tx).unwrap();

        tokio::time::sleep(Duration::from_secs(44)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.try_recv().unwrap(), BusTrigger::PollTick);
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        assert!(PollTransport::new(Duration::ZERO).is_err());
    }
}
