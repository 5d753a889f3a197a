//! Core trait definitions
//!
//! The identity provider and the document database are remote collaborators;
//! the client only depends on these contracts.

use crate::error::TypesyncResult;
use crate::types::*;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Hosted identity provider
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Email/password sign-in
    async fn sign_in_with_credential(&self, email: &str, password: &str)
        -> TypesyncResult<Principal>;

    /// Register a new email/password principal and sign it in
    async fn create_principal(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> TypesyncResult<Principal>;

    /// Federated sign-in through a popup flow
    async fn sign_in_with_popup(&self, provider: ExternalProvider) -> TypesyncResult<Principal>;

    async fn sign_out(&self) -> TypesyncResult<()>;

    /// Return a credential, refreshing it first when `force_refresh` is set
    async fn get_fresh_token(&self, force_refresh: bool) -> TypesyncResult<AuthToken>;

    /// Reload the signed-in principal's data from the provider
    async fn reload_principal(&self) -> TypesyncResult<()>;

    fn current_principal(&self) -> Option<Principal>;

    async fn set_persistence(&self, mode: PersistenceMode) -> TypesyncResult<()>;

    /// Stream of sign-in / sign-out transitions
    fn auth_state_changes(&self) -> broadcast::Receiver<Option<Principal>>;
}

/// Hosted document database
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get_document(&self, collection: &str, id: &str) -> TypesyncResult<Option<Document>>;

    /// Write `fields`; with `merge` existing fields not named are kept
    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        merge: bool,
    ) -> TypesyncResult<()>;
}
