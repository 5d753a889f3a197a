//! Profile-scoped key/value persistence
//!
//! Layers, bottom up: a [`StorageBackend`] holds raw strings; a [`SharedStore`]
//! fans writes out as change notifications to the other tabs of a profile;
//! [`LocalStore`] is one tab's handle onto it; [`SecureStore`] adds the
//! obfuscated, timestamped envelope; [`DurableQueue`] keeps TTL-bound task
//! lists on top of that.

pub mod backend;
pub mod keys;
pub mod queue;
pub mod secure;
pub mod shared;

pub use backend::{FileBackend, MemoryBackend, StorageBackend};
pub use queue::{DurableQueue, QueuedTask};
pub use secure::{SecureStore, Stored};
pub use shared::{LocalStore, SharedStore, StorageChange, StorageChanges};
