//! Authentication Module
//!
//! Identities, remote profiles and the credential freshness guard:
//! - [`identity`]: guest or signed-in principal, one per tab
//! - [`profile`]: typed access to profile documents and their entitlement
//! - [`sync`]: forced refresh, single-flight resync and resync-and-retry

pub mod identity;
pub mod profile;
pub mod sync;

pub use identity::{GuestIdentity, Identity, GUEST_UID};
pub use profile::{ProfileStore, UserProfile, USERS_COLLECTION};
pub use sync::{AuthStateSynchronizer, CrossTabSyncHandle, SyncPhase};
