//! User profiles in the remote document store
//!
//! One document per principal in the `users` collection, keyed by uid. The
//! `subscription` field is the canonical entitlement.

use crate::{ClientError, ClientResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use typesync_core::{Document, DocumentStore, EntitlementRecord, Principal};

pub const USERS_COLLECTION: &str = "users";
const SUBSCRIPTION_FIELD: &str = "subscription";

/// Remote profile of a principal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub uid: String,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_login_at: DateTime<Utc>,
    pub subscription: EntitlementRecord,
}

impl UserProfile {
    /// Fresh profile with the free entitlement
    pub fn new_default(principal: &Principal, now: DateTime<Utc>) -> Self {
        Self {
            uid: principal.uid.clone(),
            email: principal.email.clone(),
            display_name: principal.display_name.clone(),
            created_at: now,
            last_login_at: now,
            subscription: EntitlementRecord::free(now),
        }
    }
}

/// Typed access to profile documents
#[derive(Clone)]
pub struct ProfileStore {
    documents: Arc<dyn DocumentStore>,
}

impl ProfileStore {
    pub fn new(documents: Arc<dyn DocumentStore>) -> Self {
        Self { documents }
    }

    pub async fn load_profile(&self, uid: &str) -> ClientResult<Option<UserProfile>> {
        let Some(document) = self.documents.get_document(USERS_COLLECTION, uid).await? else {
            debug!(user_id = uid, "No profile document");
            return Ok(None);
        };
        let profile = serde_json::from_value(serde_json::Value::Object(document))?;
        Ok(Some(profile))
    }

    /// Write the whole profile, replacing any existing document
    pub async fn save_profile(&self, profile: &UserProfile) -> ClientResult<()> {
        let fields = to_document(profile)?;
        self.documents
            .set_document(USERS_COLLECTION, &profile.uid, fields, false)
            .await?;
        debug!(user_id = %profile.uid, "Profile saved");
        Ok(())
    }

    /// Merge everything except the subscription into the stored profile
    pub async fn save_identity_fields(&self, profile: &UserProfile) -> ClientResult<()> {
        let mut fields = to_document(profile)?;
        fields.remove(SUBSCRIPTION_FIELD);
        self.documents
            .set_document(USERS_COLLECTION, &profile.uid, fields, true)
            .await?;
        Ok(())
    }

    /// Canonical entitlement of `uid`; `None` when no profile exists
    pub async fn fetch_entitlement(&self, uid: &str) -> ClientResult<Option<EntitlementRecord>> {
        let Some(mut document) = self.documents.get_document(USERS_COLLECTION, uid).await? else {
            return Ok(None);
        };
        match document.remove(SUBSCRIPTION_FIELD) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Replace the subscription field of `uid`'s profile
    pub async fn write_entitlement(&self, uid: &str, record: &EntitlementRecord) -> ClientResult<()> {
        let mut fields = Document::new();
        fields.insert(SUBSCRIPTION_FIELD.to_string(), serde_json::to_value(record)?);
        self.documents
            .set_document(USERS_COLLECTION, uid, fields, true)
            .await?;
        debug!(user_id = uid, tier = %record.tier, "Entitlement written");
        Ok(())
    }
}

fn to_document<T: Serialize>(value: &T) -> ClientResult<Document> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(fields) => Ok(fields),
        other => Err(ClientError::internal(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::InMemoryBackend;
    use typesync_core::SubscriptionTier;

    fn principal() -> Principal {
        Principal {
            uid: "u1".to_string(),
            email: "ada@example.com".to_string(),
            display_name: Some("Ada".to_string()),
        }
    }

    #[tokio::test]
    async fn test_identity_fields_do_not_touch_subscription() {
        let backend = InMemoryBackend::with_system_clock();
        let profiles = ProfileStore::new(backend.clone());
        let now = Utc::now();

        let mut stored = UserProfile::new_default(&principal(), now);
        stored.subscription = EntitlementRecord::for_tier(SubscriptionTier::Pro, now);
        profiles.save_profile(&stored).await.unwrap();

        // A synthesized default must never downgrade the stored plan
        let fallback = UserProfile::new_default(&principal(), now);
        profiles.save_identity_fields(&fallback).await.unwrap();

        let entitlement = profiles.fetch_entitlement("u1").await.unwrap().unwrap();
        assert_eq!(entitlement.tier, SubscriptionTier::Pro);
    }

    #[tokio::test]
    async fn test_profile_round_trips_through_documents() {
        let backend = InMemoryBackend::with_system_clock();
        let profiles = ProfileStore::new(backend.clone());
        let profile = UserProfile::new_default(&principal(), Utc::now());

        profiles.save_profile(&profile).await.unwrap();
        let doc = backend.document(USERS_COLLECTION, "u1").unwrap();
        assert_eq!(doc["subscription"]["tier"], "free");
        assert_eq!(doc["displayName"], "Ada");

        assert_eq!(profiles.load_profile("u1").await.unwrap(), Some(profile));
        assert_eq!(profiles.load_profile("missing").await.unwrap(), None);
    }
}
