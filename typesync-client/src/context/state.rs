//! Observable state of the auth context

use crate::auth::Identity;
use serde::{Deserialize, Serialize};
use typesync_core::{EntitlementRecord, SubscriptionTier};

/// Snapshot published to the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub identity: Identity,
    /// An authentication transition is in progress
    pub loading: bool,
}

impl AuthState {
    pub fn starting() -> Self {
        Self {
            identity: Identity::guest(),
            loading: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// One-time message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }
}

/// Result of an upgrade request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// Requested while signed out; replayed after the next sign-in
    Deferred,
    /// The current plan already covers the request; nothing written
    AlreadyEntitled(SubscriptionTier),
    /// Written remotely and published to the other tabs
    Upgraded(EntitlementRecord),
    /// Applied locally; the remote write is queued for retry
    Queued(EntitlementRecord),
}

/// Entitlement write waiting for the remote to accept it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpgrade {
    pub user_id: String,
    pub record: EntitlementRecord,
}

/// Action requested by a guest, replayed once signed in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PostAuthAction {
    Upgrade { tier: SubscriptionTier },
}
