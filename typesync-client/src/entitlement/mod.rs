//! Entitlement Synchronization
//!
//! Cross-tab propagation of subscription changes. Signals travel over the
//! shared storage key, a named channel and an in-page event; a fixed poll and
//! an independent reconciler bound how long any tab can stay stale.

pub mod bus;
pub mod reconcile;
pub mod signal;
pub mod transport;

pub use bus::EntitlementBus;
pub use reconcile::EntitlementReconciler;
pub use signal::{BusEvent, BusTrigger, EntitlementSignal, PublishReport};
pub use transport::{
    BroadcastChannelTransport, EntitlementTransport, InPageTransport, PollTransport,
    StorageSignalTransport, TransportSelection, TriggerSender, PAGE_EVENT_NAME,
};
