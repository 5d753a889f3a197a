//! Entitlement change signals

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typesync_core::{EntitlementRecord, SubscriptionTier};

/// Payload published after a tab changes a user's entitlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSignal {
    pub tier: SubscriptionTier,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
}

impl EntitlementSignal {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tier": self.tier,
            "timestamp": self.timestamp,
            "userId": self.user_id,
        })
    }

    /// Parse a payload received from a transport; malformed payloads are ignored
    pub fn from_json(value: serde_json::Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }
}

/// What woke the bus up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTrigger {
    Signal {
        transport: &'static str,
        signal: EntitlementSignal,
    },
    PollTick,
}

impl BusTrigger {
    pub fn origin(&self) -> &'static str {
        match self {
            BusTrigger::Signal { transport, .. } => transport,
            BusTrigger::PollTick => "poll",
        }
    }
}

/// Cache changes announced by the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A trigger revealed a different remote tier
    Refreshed {
        user_id: String,
        previous: SubscriptionTier,
        current: EntitlementRecord,
    },
    /// The reconciler found the cache out of step with the remote
    Corrected {
        user_id: String,
        previous: SubscriptionTier,
        current: EntitlementRecord,
    },
}

impl BusEvent {
    pub fn user_id(&self) -> &str {
        match self {
            BusEvent::Refreshed { user_id, .. } | BusEvent::Corrected { user_id, .. } => user_id,
        }
    }

    pub fn current(&self) -> &EntitlementRecord {
        match self {
            BusEvent::Refreshed { current, .. } | BusEvent::Corrected { current, .. } => current,
        }
    }
}

/// Per-transport outcome of a publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

impl PublishReport {
    pub fn all_failed(&self) -> bool {
        self.delivered.is_empty()
    }
}
