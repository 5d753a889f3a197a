//! Core data type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::logging::LoggingConfig;

/// Remote document payload (a JSON object of fields)
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Subscription tier, totally ordered `Free < Premium < Pro`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Premium,
    Pro,
}

impl SubscriptionTier {
    /// Feature flags granted by this tier
    pub fn features(&self) -> FeatureSet {
        match self {
            SubscriptionTier::Free => FeatureSet {
                themes_unlocked: 2,
                lessons_unlocked: 3,
                advanced_analytics: false,
                ad_free: false,
                custom_lessons: false,
                priority_support: false,
            },
            SubscriptionTier::Premium => FeatureSet {
                themes_unlocked: 10,
                lessons_unlocked: 25,
                advanced_analytics: true,
                ad_free: true,
                custom_lessons: false,
                priority_support: false,
            },
            SubscriptionTier::Pro => FeatureSet {
                themes_unlocked: 20,
                lessons_unlocked: 100,
                advanced_analytics: true,
                ad_free: true,
                custom_lessons: true,
                priority_support: true,
            },
        }
    }
}

impl fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionTier::Free => write!(f, "free"),
            SubscriptionTier::Premium => write!(f, "premium"),
            SubscriptionTier::Pro => write!(f, "pro"),
        }
    }
}

impl std::str::FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(SubscriptionTier::Free),
            "premium" => Ok(SubscriptionTier::Premium),
            "pro" => Ok(SubscriptionTier::Pro),
            _ => Err(format!("Unknown subscription tier: {}", s)),
        }
    }
}

/// Feature flags derived from a tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureSet {
    pub themes_unlocked: u32,
    pub lessons_unlocked: u32,
    pub advanced_analytics: bool,
    pub ad_free: bool,
    pub custom_lessons: bool,
    pub priority_support: bool,
}

/// Subscription entitlement of a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementRecord {
    pub tier: SubscriptionTier,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub features: FeatureSet,
}

impl EntitlementRecord {
    /// Entitlement for `tier` starting at `start_date`, features derived from the tier
    pub fn for_tier(tier: SubscriptionTier, start_date: DateTime<Utc>) -> Self {
        Self {
            tier,
            start_date,
            end_date: None,
            features: tier.features(),
        }
    }

    /// The default free entitlement
    pub fn free(start_date: DateTime<Utc>) -> Self {
        Self::for_tier(SubscriptionTier::Free, start_date)
    }

    /// Whether this entitlement already covers `tier`
    pub fn covers(&self, tier: SubscriptionTier) -> bool {
        self.tier >= tier
    }
}

/// Authenticated principal as reported by the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
}

/// Short-lived credential issued by the identity provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

/// Where the identity provider keeps its credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistenceMode {
    /// Survives browser restarts
    Durable,
    /// Cleared when the browsing session ends
    Session,
}

/// Federated sign-in providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExternalProvider {
    Google,
    Github,
}

impl fmt::Display for ExternalProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalProvider::Google => write!(f, "google"),
            ExternalProvider::Github => write!(f, "github"),
        }
    }
}

/// Error codes reported by the identity provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderErrorCode {
    InvalidCredential,
    UserNotFound,
    WrongPassword,
    EmailAlreadyInUse,
    WeakPassword,
    InvalidEmail,
    UserDisabled,
    TooManyRequests,
    NetworkRequestFailed,
    PopupClosed,
    PermissionDenied,
    Unauthenticated,
    Unknown,
}

impl ProviderErrorCode {
    /// Codes a credential resync may cure
    pub fn is_permission_class(&self) -> bool {
        matches!(
            self,
            ProviderErrorCode::PermissionDenied | ProviderErrorCode::Unauthenticated
        )
    }

    /// Human readable message for the sign-in / sign-up surface
    pub fn user_message(&self) -> &'static str {
        match self {
            ProviderErrorCode::InvalidCredential
            | ProviderErrorCode::UserNotFound
            | ProviderErrorCode::WrongPassword => "Invalid email or password.",
            ProviderErrorCode::EmailAlreadyInUse => "An account with this email already exists.",
            ProviderErrorCode::WeakPassword => "Password should be at least 6 characters.",
            ProviderErrorCode::InvalidEmail => "Please enter a valid email address.",
            ProviderErrorCode::UserDisabled => "This account has been disabled.",
            ProviderErrorCode::TooManyRequests => {
                "Too many attempts. Please wait a moment and try again."
            }
            ProviderErrorCode::NetworkRequestFailed => {
                "Network error. Check your connection and try again."
            }
            ProviderErrorCode::PopupClosed => "Sign-in was cancelled.",
            ProviderErrorCode::PermissionDenied | ProviderErrorCode::Unauthenticated => {
                "Your session could not be verified. Please sign in again."
            }
            ProviderErrorCode::Unknown => "Something went wrong. Please try again.",
        }
    }
}

impl fmt::Display for ProviderErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ProviderErrorCode::InvalidCredential => "auth/invalid-credential",
            ProviderErrorCode::UserNotFound => "auth/user-not-found",
            ProviderErrorCode::WrongPassword => "auth/wrong-password",
            ProviderErrorCode::EmailAlreadyInUse => "auth/email-already-in-use",
            ProviderErrorCode::WeakPassword => "auth/weak-password",
            ProviderErrorCode::InvalidEmail => "auth/invalid-email",
            ProviderErrorCode::UserDisabled => "auth/user-disabled",
            ProviderErrorCode::TooManyRequests => "auth/too-many-requests",
            ProviderErrorCode::NetworkRequestFailed => "auth/network-request-failed",
            ProviderErrorCode::PopupClosed => "auth/popup-closed-by-user",
            ProviderErrorCode::PermissionDenied => "permission-denied",
            ProviderErrorCode::Unauthenticated => "unauthenticated",
            ProviderErrorCode::Unknown => "unknown",
        };
        write!(f, "{}", code)
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypesyncConfig {
    pub session: SessionSettings,
    pub entitlement: EntitlementSettings,
    pub retry: RetrySettings,
    pub queue: QueueSettings,
    pub storage: StorageSettings,
    #[serde(default)]
    pub redeem_codes: HashMap<String, SubscriptionTier>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Session lifetime when the device is not trusted
    pub default_duration_days: i64,
    /// Session lifetime when the user asks to trust this device
    pub trusted_duration_days: i64,
    /// How long before expiry the warning fires
    pub expiry_warning_minutes: i64,
    /// Minimum gap between two activity refreshes
    pub activity_throttle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementSettings {
    pub poll_interval_secs: u64,
    pub reconcile_interval_secs: u64,
    /// Name of the cross-tab publish/subscribe channel
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    pub upgrade_retry_ttl_hours: i64,
    pub post_auth_action_ttl_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory of the file-backed profile store
    pub data_dir: String,
}
