//! Session data types

use crate::fingerprint::DeviceFingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typesync_core::Principal;

/// Persisted record of the signed-in principal on this profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub user_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub login_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub device_fingerprint: DeviceFingerprint,
    pub session_id: String,
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether this record belongs to `principal`
    pub fn is_owned_by(&self, principal: &Principal) -> bool {
        self.user_id == principal.uid
    }
}

/// Options chosen at sign-in, adjustable afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub remember_me: bool,
    pub session_duration_days: i64,
    pub auto_login: bool,
    pub trusted_device: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            remember_me: false,
            session_duration_days: 7,
            auto_login: false,
            trusted_device: false,
        }
    }
}

impl SessionConfig {
    /// Config for a sign-in with the given trust choice
    pub fn for_sign_in(trusted_device: bool, session_duration_days: i64) -> Self {
        Self {
            remember_me: trusted_device,
            session_duration_days,
            auto_login: trusted_device,
            trusted_device,
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        chrono::Duration::days(self.session_duration_days)
    }

    /// Apply a partial update; returns whether the duration changed
    pub fn apply(&mut self, update: &SessionConfigUpdate) -> bool {
        if let Some(remember_me) = update.remember_me {
            self.remember_me = remember_me;
        }
        if let Some(auto_login) = update.auto_login {
            self.auto_login = auto_login;
        }
        if let Some(trusted_device) = update.trusted_device {
            self.trusted_device = trusted_device;
        }
        match update.session_duration_days {
            Some(days) if days != self.session_duration_days => {
                self.session_duration_days = days;
                true
            }
            _ => false,
        }
    }
}

/// Partial [`SessionConfig`] update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfigUpdate {
    pub remember_me: Option<bool>,
    pub session_duration_days: Option<i64>,
    pub auto_login: Option<bool>,
    pub trusted_device: Option<bool>,
}

/// A device this profile has seen, keyed by fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub fingerprint: DeviceFingerprint,
    pub user_agent_signature: String,
    pub trusted: bool,
    pub first_seen: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub nickname: Option<String>,
}

/// Why a stored session was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    Expired,
    DeviceMismatch,
    Corrupt,
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        session_id: String,
        user_id: String,
        expires_at: DateTime<Utc>,
    },
    Extended {
        expires_at: DateTime<Utc>,
    },
    ExpiryWarning {
        expires_at: DateTime<Utc>,
    },
    /// The watched session ran past its expiry while the tab was open
    Expired {
        expires_at: DateTime<Utc>,
    },
    Cleared,
    Rejected(RejectionReason),
}
