//! Session Management Module
//!
//! Session lifecycle for a signed-in principal: persisted record and config,
//! device trust, expiry warnings and activity tracking.

pub mod activity;
pub mod devices;
pub mod manager;
pub mod timer;
pub mod types;

pub use activity::ActivityTracker;
pub use devices::TrustedDevices;
pub use manager::SessionManager;
pub use timer::ExpiryScheduler;
pub use types::*;
