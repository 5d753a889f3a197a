//! Identity Management
//!
//! Exactly one identity is active per tab: either the well-known guest or a
//! signed-in principal with its profile.

use super::profile::UserProfile;
use chrono::{DateTime, Utc};
use typesync_core::{EntitlementRecord, FeatureSet, SubscriptionTier};

/// Uid of the guest pseudo-principal
pub const GUEST_UID: &str = "guest";

/// Unauthenticated visitor with a fixed free entitlement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestIdentity {
    entitlement: EntitlementRecord,
}

impl GuestIdentity {
    pub fn new() -> Self {
        Self {
            entitlement: EntitlementRecord::free(DateTime::<Utc>::UNIX_EPOCH),
        }
    }

    pub fn uid(&self) -> &str {
        GUEST_UID
    }

    pub fn entitlement(&self) -> &EntitlementRecord {
        &self.entitlement
    }
}

impl Default for GuestIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// The active identity of a tab
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Guest(GuestIdentity),
    Principal(UserProfile),
}

impl Identity {
    pub fn guest() -> Self {
        Identity::Guest(GuestIdentity::new())
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Identity::Guest(_))
    }

    pub fn uid(&self) -> &str {
        match self {
            Identity::Guest(guest) => guest.uid(),
            Identity::Principal(profile) => &profile.uid,
        }
    }

    /// The signed-in profile, if any
    pub fn profile(&self) -> Option<&UserProfile> {
        match self {
            Identity::Guest(_) => None,
            Identity::Principal(profile) => Some(profile),
        }
    }

    pub fn entitlement(&self) -> &EntitlementRecord {
        match self {
            Identity::Guest(guest) => guest.entitlement(),
            Identity::Principal(profile) => &profile.subscription,
        }
    }

    pub fn tier(&self) -> SubscriptionTier {
        self.entitlement().tier
    }

    pub fn features(&self) -> &FeatureSet {
        &self.entitlement().features
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::guest()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_is_free() {
        let guest = Identity::guest();
        assert!(guest.is_guest());
        assert_eq!(guest.uid(), "guest");
        assert_eq!(guest.tier(), SubscriptionTier::Free);
        assert_eq!(guest.features().themes_unlocked, 2);
        assert_eq!(guest.features().lessons_unlocked, 3);
        assert!(!guest.features().ad_free);
        assert!(guest.profile().is_none());
    }
}
