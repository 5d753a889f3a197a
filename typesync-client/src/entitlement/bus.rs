//! Entitlement Synchronization Bus
//!
//! Keeps one tab's cached entitlement in step with the remote profile. Any
//! trigger (a signal from another tab, the in-page event or a poll tick)
//! leads to a guarded refetch of the canonical record; the remote wins,
//! except over an upgrade whose write is still queued. Publishing fans a signal out over every transport and never fails
//! the caller.

use super::signal::{BusEvent, BusTrigger, EntitlementSignal, PublishReport};
use super::transport::{
    BroadcastChannelTransport, EntitlementTransport, InPageTransport, PollTransport,
    StorageSignalTransport, TransportSelection,
};
use crate::auth::{AuthStateSynchronizer, ProfileStore};
use crate::runtime::TabEnvironment;
use crate::ClientResult;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use typesync_core::{
    EntitlementRecord, EntitlementSettings, SharedClock, SubscriptionTier, TaskGroup,
};

#[derive(Debug, Clone)]
struct ActiveEntitlement {
    user_id: String,
    record: EntitlementRecord,
    /// Optimistic record whose remote write is still queued
    held: Option<EntitlementRecord>,
}

struct BusInner {
    transports: Vec<Arc<dyn EntitlementTransport>>,
    sync: Arc<AuthStateSynchronizer>,
    profiles: ProfileStore,
    clock: SharedClock,
    active: Mutex<Option<ActiveEntitlement>>,
    events: broadcast::Sender<BusEvent>,
    tasks: TaskGroup,
    running: AtomicBool,
}

/// Multi-transport entitlement bus for one tab
#[derive(Clone)]
pub struct EntitlementBus {
    inner: Arc<BusInner>,
}

impl EntitlementBus {
    pub fn new(
        transports: Vec<Arc<dyn EntitlementTransport>>,
        sync: Arc<AuthStateSynchronizer>,
        profiles: ProfileStore,
        clock: SharedClock,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(BusInner {
                transports,
                sync,
                profiles,
                clock,
                active: Mutex::new(None),
                events,
                tasks: TaskGroup::new(),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Bus over the tab's selected transports plus the poll
    pub fn for_tab(
        tab: &TabEnvironment,
        selection: TransportSelection,
        settings: &EntitlementSettings,
        sync: Arc<AuthStateSynchronizer>,
        profiles: ProfileStore,
        clock: SharedClock,
    ) -> ClientResult<Self> {
        let mut transports: Vec<Arc<dyn EntitlementTransport>> = Vec::new();

        if selection.storage_signal {
            transports.push(Arc::new(StorageSignalTransport::new(
                tab.durable_store().clone(),
            )));
        }
        if selection.broadcast_channel {
            match BroadcastChannelTransport::open(tab, &settings.channel_name) {
                Some(transport) => transports.push(Arc::new(transport)),
                None => debug!(tab = %tab.id(), "Named channels unavailable, skipping"),
            }
        }
        if selection.in_page {
            transports.push(Arc::new(InPageTransport::new(tab.clone())));
        }
        transports.push(Arc::new(PollTransport::new(settings.poll_interval())?));

        Ok(Self::new(transports, sync, profiles, clock))
    }

    pub fn transport_names(&self) -> Vec<&'static str> {
        self.inner.transports.iter().map(|t| t.name()).collect()
    }

    /// Track `user_id` with `record` as the cached entitlement and start listening
    pub fn activate(&self, user_id: &str, record: EntitlementRecord) {
        *self.inner.active.lock() = Some(ActiveEntitlement {
            user_id: user_id.to_string(),
            record,
            held: None,
        });
        self.start();
    }

    /// Forget the active user and stop listening
    pub fn deactivate(&self) {
        self.inner.active.lock().take();
        self.stop();
    }

    /// Subscribe every transport and start dispatching triggers
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for transport in &self.inner.transports {
            match transport.subscribe(tx.clone()) {
                Ok(handle) => self.inner.tasks.adopt(handle),
                Err(e) => warn!(transport = transport.name(), error = %e, "Transport subscribe failed"),
            }
        }
        drop(tx);

        self.inner
            .tasks
            .spawn(dispatch(Arc::downgrade(&self.inner), rx));
        info!(transports = ?self.transport_names(), "Entitlement bus started");
    }

    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::SeqCst) {
            self.inner.tasks.abort_all();
            info!("Entitlement bus stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn active_user(&self) -> Option<String> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.user_id.clone())
    }

    pub fn cached(&self) -> Option<EntitlementRecord> {
        self.inner
            .active
            .lock()
            .as_ref()
            .map(|active| active.record.clone())
    }

    /// Cached record, if `user_id` is the active user
    pub fn cached_for(&self, user_id: &str) -> Option<EntitlementRecord> {
        self.inner
            .active
            .lock()
            .as_ref()
            .filter(|active| active.user_id == user_id)
            .map(|active| active.record.clone())
    }

    /// Replace the cache for `user_id`; false when another user is active
    pub fn set_cached(&self, user_id: &str, record: EntitlementRecord) -> bool {
        match self.inner.active.lock().as_mut() {
            Some(active) if active.user_id == user_id => {
                active.record = record;
                true
            }
            _ => false,
        }
    }

    /// Raise the cache to `record` and keep it until the remote catches up.
    ///
    /// Refreshes that bring a lower tier leave the cache alone while the hold
    /// lasts; one that reaches the held tier releases it.
    pub fn hold(&self, user_id: &str, record: EntitlementRecord) -> bool {
        match self.inner.active.lock().as_mut() {
            Some(active) if active.user_id == user_id => {
                debug!(user_id, tier = %record.tier, "Holding optimistic entitlement");
                if active.record.tier < record.tier {
                    active.record = record.clone();
                }
                active.held = Some(record);
                true
            }
            _ => false,
        }
    }

    pub fn release(&self, user_id: &str) {
        if let Some(active) = self
            .inner
            .active
            .lock()
            .as_mut()
            .filter(|active| active.user_id == user_id)
        {
            active.held = None;
        }
    }

    pub fn held_for(&self, user_id: &str) -> Option<EntitlementRecord> {
        self.inner
            .active
            .lock()
            .as_ref()
            .filter(|active| active.user_id == user_id)
            .and_then(|active| active.held.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Announce `tier` for `user_id` on every publishing transport
    pub fn publish(&self, user_id: &str, tier: SubscriptionTier) -> PublishReport {
        let signal = EntitlementSignal {
            tier,
            timestamp: self.inner.clock.now(),
            user_id: user_id.to_string(),
        };

        let mut report = PublishReport::default();
        for transport in self.inner.transports.iter().filter(|t| t.publishes()) {
            match transport.publish(&signal) {
                Ok(()) => report.delivered.push(transport.name()),
                Err(e) => {
                    warn!(transport = transport.name(), user_id, error = %e, "Entitlement publish failed");
                    report.failed.push((transport.name(), e.to_string()));
                }
            }
        }

        debug!(user_id, %tier, delivered = ?report.delivered, "Entitlement published");
        report
    }

    /// Canonical record of `user_id`, fetched behind the auth guard
    pub async fn fetch_canonical(&self, user_id: &str) -> ClientResult<Option<EntitlementRecord>> {
        let profiles = self.inner.profiles.clone();
        let uid = user_id.to_string();
        self.inner
            .sync
            .retry_with_auth_sync("fetch_entitlement", move || {
                let profiles = profiles.clone();
                let uid = uid.clone();
                async move { profiles.fetch_entitlement(&uid).await }
            })
            .await
    }

    /// Refetch and apply the remote record; returns the event if the tier changed
    pub async fn refresh_from_remote(
        &self,
        user_id: &str,
        origin: &str,
    ) -> ClientResult<Option<BusEvent>> {
        let Some(remote) = self.fetch_canonical(user_id).await? else {
            debug!(user_id, origin, "No remote entitlement to apply");
            return Ok(None);
        };
        Ok(self.apply_remote(user_id, remote, false))
    }

    /// Make `remote` the cached record if `user_id` is still active
    pub(crate) fn apply_remote(
        &self,
        user_id: &str,
        remote: EntitlementRecord,
        corrected: bool,
    ) -> Option<BusEvent> {
        let previous = {
            let mut slot = self.inner.active.lock();
            let Some(active) = slot.as_mut().filter(|a| a.user_id == user_id) else {
                debug!(user_id, "Active user changed during refresh, discarding result");
                return None;
            };
            if let Some(held) = &active.held {
                if remote.tier < held.tier {
                    debug!(user_id, remote = %remote.tier, held = %held.tier, "Remote behind a queued upgrade, keeping local record");
                    return None;
                }
                active.held = None;
            }
            let previous = active.record.tier;
            active.record = remote.clone();
            previous
        };

        if previous == remote.tier {
            return None;
        }

        let event = if corrected {
            warn!(user_id, %previous, current = %remote.tier, "Entitlement mismatch corrected");
            BusEvent::Corrected {
                user_id: user_id.to_string(),
                previous,
                current: remote,
            }
        } else {
            info!(user_id, %previous, current = %remote.tier, "Entitlement refreshed");
            BusEvent::Refreshed {
                user_id: user_id.to_string(),
                previous,
                current: remote,
            }
        };
        let _ = self.inner.events.send(event.clone());
        Some(event)
    }

    async fn handle_triggers(&self, triggers: Vec<BusTrigger>) {
        let Some(user_id) = self.active_user() else {
            debug!(count = triggers.len(), "Triggers ignored, no signed-in user");
            return;
        };

        let relevant = triggers.iter().find(|trigger| match trigger {
            BusTrigger::Signal { signal, .. } => signal.user_id == user_id,
            BusTrigger::PollTick => true,
        });
        let Some(trigger) = relevant else {
            debug!(user_id = %user_id, "Signals for another user ignored");
            return;
        };

        let origin = trigger.origin();
        if let Err(e) = self.refresh_from_remote(&user_id, origin).await {
            warn!(user_id = %user_id, origin, error = %e, "Entitlement refresh failed");
        }
    }
}

/// Drain triggers, coalescing bursts into one refresh
async fn dispatch(bus: Weak<BusInner>, mut triggers: mpsc::UnboundedReceiver<BusTrigger>) {
    while let Some(first) = triggers.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = triggers.try_recv() {
            batch.push(next);
        }

        let Some(inner) = bus.upgrade() else { break };
        EntitlementBus { inner }.handle_triggers(batch).await;
    }
}
