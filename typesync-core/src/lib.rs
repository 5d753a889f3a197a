//! Typesync Core - Core data structures and trait definitions
//!
//! This module defines the core abstractions shared by the session and
//! entitlement synchronization client: errors, logging, configuration, the
//! clock, the remote collaborator traits and the async helpers.

pub mod async_utils;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod traits;
pub mod types;

pub use async_utils::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use logging::*;
pub use traits::*;
pub use types::*;

// Re-export commonly used external types
pub use async_trait::async_trait;
pub use tokio;
pub use tracing;
