//! Typesync Client - session lifecycle and cross-tab entitlement synchronization
//!
//! This crate keeps a signed-in session alive across the tabs of a browser
//! profile and reconciles the user's subscription entitlement between the
//! local cache, the remote document store and every other open tab:
//!
//! - [`session`]: session creation, expiry, extension and device trust
//! - [`auth`]: credential freshness guard with resync-and-retry, identities and profiles
//! - [`entitlement`]: multi-transport broadcast/poll bus plus periodic reconciliation
//! - [`context`]: the orchestrator consumed by the UI layer
//!
//! ## Architecture
//!
//! The browser is modelled explicitly ([`runtime`]): a profile owns the durable
//! store and the named channel hub, each tab owns its session store, in-page
//! events and environment signals. Remote collaborators are the traits from
//! `typesync-core`; [`remote::InMemoryBackend`] implements both for tests and
//! simulations.

pub mod auth;
pub mod context;
pub mod entitlement;
pub mod fingerprint;
pub mod remote;
pub mod runtime;
pub mod session;
pub mod store;

pub use auth::{AuthStateSynchronizer, GuestIdentity, Identity, ProfileStore, SyncPhase, UserProfile};
pub use context::{AuthContext, AuthContextDeps, AuthState, Notice, NoticeLevel, UpgradeOutcome};
pub use entitlement::{
    BusEvent, EntitlementBus, EntitlementSignal, EntitlementTransport, TransportSelection,
};
pub use fingerprint::{DeviceFingerprint, EnvironmentSignals};
pub use remote::{Fault, InMemoryBackend};
pub use runtime::{BrowserProfile, EnvironmentEvent, InputKind, TabEnvironment, TabId};
pub use session::{
    DeviceRecord, SessionConfig, SessionConfigUpdate, SessionEvent, SessionManager, SessionRecord,
};
pub use store::{DurableQueue, LocalStore, SecureStore, SharedStore};

use typesync_core::{ProviderErrorCode, TypesyncError};

/// Client-level error type
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Core error: {0}")]
    Core(#[from] TypesyncError),

    /// Identity provider failure already mapped to a user-facing message
    #[error("{message}")]
    Provider {
        code: ProviderErrorCode,
        message: String,
    },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Entitlement error: {message}")]
    Entitlement { message: String },

    #[error("Auth sync failed: {message}")]
    AuthSync { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;

impl ClientError {
    /// Create a session error
    pub fn session<S: Into<String>>(message: S) -> Self {
        Self::Session {
            message: message.into(),
        }
    }

    /// Create an entitlement error
    pub fn entitlement<S: Into<String>>(message: S) -> Self {
        Self::Entitlement {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(message: S) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Whether a credential resync may cure this failure
    pub fn is_permission_error(&self) -> bool {
        match self {
            ClientError::Core(core) => core.is_permission_error(),
            ClientError::Provider { code, .. } => code.is_permission_class(),
            other => typesync_core::message_indicates_permission(&other.to_string()),
        }
    }

    /// Replace identity provider failures with their user-facing message.
    ///
    /// Used on the sign-in / sign-up surface where a single readable error is
    /// propagated to the caller.
    pub fn into_user_facing(self) -> Self {
        match self {
            ClientError::Core(TypesyncError::Provider { code, .. }) => ClientError::Provider {
                code,
                message: code.user_message().to_string(),
            },
            ClientError::Core(TypesyncError::Network { .. }) => ClientError::Provider {
                code: ProviderErrorCode::NetworkRequestFailed,
                message: ProviderErrorCode::NetworkRequestFailed
                    .user_message()
                    .to_string(),
            },
            other => other,
        }
    }

    /// Message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Provider { message, .. } => message.clone(),
            ClientError::Core(TypesyncError::Provider { code, .. }) => {
                code.user_message().to_string()
            }
            ClientError::Validation { message } => message.clone(),
            _ => ProviderErrorCode::Unknown.user_message().to_string(),
        }
    }
}
