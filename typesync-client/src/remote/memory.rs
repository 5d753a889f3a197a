//! In-memory identity provider and document store
//!
//! Stands in for the hosted services in tests, the CLI simulation and any
//! embedding without a network. One instance models one account backend:
//! tabs that share an instance share the signed-in principal, the same way
//! tabs of one browser profile share the provider's persisted credential.

use async_trait::async_trait;
use chrono::Duration;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use typesync_core::{
    AuthToken, Document, DocumentStore, ErrorContext, ExternalProvider, IdentityProvider,
    PersistenceMode, Principal, ProviderErrorCode, SharedClock, SystemClock, TypesyncError,
    TypesyncResult,
};

const COMPONENT: &str = "in_memory_backend";

/// Kind of failure injected into the next remote calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Rejected by security rules; cured by a credential resync
    PermissionDenied,
    /// Service unreachable
    Unavailable,
}

impl Fault {
    fn into_error(self, operation: &str) -> TypesyncError {
        match self {
            Fault::PermissionDenied => TypesyncError::provider(
                ProviderErrorCode::PermissionDenied,
                "Missing or insufficient permissions.",
                COMPONENT,
            ),
            Fault::Unavailable => unavailable(operation),
        }
    }
}

fn unavailable(operation: &str) -> TypesyncError {
    TypesyncError::Network {
        message: format!("{} failed: service unavailable", operation),
        source: None,
        context: ErrorContext::new(COMPONENT).with_operation(operation),
    }
}

fn provider_error(code: ProviderErrorCode) -> TypesyncError {
    TypesyncError::provider(code, code.to_string(), COMPONENT)
}

#[derive(Debug, Clone)]
struct Account {
    uid: String,
    password: String,
    display_name: Option<String>,
    disabled: bool,
}

#[derive(Default)]
struct FaultPlan {
    reads: VecDeque<Fault>,
    writes: VecDeque<Fault>,
    token_refreshes: VecDeque<Fault>,
}

struct BackendState {
    accounts: HashMap<String, Account>,
    current: Option<Principal>,
    popup_principal: Option<Principal>,
    persistence: PersistenceMode,
    documents: HashMap<(String, String), Document>,
    faults: FaultPlan,
    offline: bool,
}

#[derive(Default)]
struct Counters {
    token_refreshes: AtomicUsize,
    reloads: AtomicUsize,
    document_reads: AtomicUsize,
    document_writes: AtomicUsize,
}

/// In-memory implementation of [`IdentityProvider`] and [`DocumentStore`]
pub struct InMemoryBackend {
    clock: SharedClock,
    state: Mutex<BackendState>,
    counters: Counters,
    auth_events: broadcast::Sender<Option<Principal>>,
}

impl InMemoryBackend {
    pub fn new(clock: SharedClock) -> Arc<Self> {
        let (auth_events, _) = broadcast::channel(64);
        Arc::new(Self {
            clock,
            state: Mutex::new(BackendState {
                accounts: HashMap::new(),
                current: None,
                popup_principal: None,
                persistence: PersistenceMode::Session,
                documents: HashMap::new(),
                faults: FaultPlan::default(),
                offline: false,
            }),
            counters: Counters::default(),
            auth_events,
        })
    }

    pub fn with_system_clock() -> Arc<Self> {
        Self::new(Arc::new(SystemClock))
    }

    /// Register an email/password account without signing it in
    pub fn register_account(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> Principal {
        let uid = new_uid();
        self.state.lock().accounts.insert(
            email.to_lowercase(),
            Account {
                uid: uid.clone(),
                password: password.to_string(),
                display_name: display_name.map(str::to_string),
                disabled: false,
            },
        );
        Principal {
            uid,
            email: email.to_string(),
            display_name: display_name.map(str::to_string),
        }
    }

    pub fn disable_account(&self, email: &str) {
        if let Some(account) = self.state.lock().accounts.get_mut(&email.to_lowercase()) {
            account.disabled = true;
        }
    }

    /// Principal returned by the next popup sign-in; without one the popup is closed
    pub fn set_popup_principal(&self, principal: Principal) {
        self.state.lock().popup_principal = Some(principal);
    }

    /// Fail the next `count` document reads
    pub fn fail_document_reads(&self, count: usize, fault: Fault) {
        self.state
            .lock()
            .faults
            .reads
            .extend(std::iter::repeat(fault).take(count));
    }

    /// Fail the next `count` document writes
    pub fn fail_document_writes(&self, count: usize, fault: Fault) {
        self.state
            .lock()
            .faults
            .writes
            .extend(std::iter::repeat(fault).take(count));
    }

    /// Fail the next `count` forced token refreshes
    pub fn fail_token_refreshes(&self, count: usize, fault: Fault) {
        self.state
            .lock()
            .faults
            .token_refreshes
            .extend(std::iter::repeat(fault).take(count));
    }

    /// While offline every remote call fails as unavailable
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Drop the signed-in principal as if the credential were revoked server-side
    pub fn revoke_current(&self) {
        self.state.lock().current = None;
        let _ = self.auth_events.send(None);
    }

    /// Read a document directly, bypassing faults and counters
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.state
            .lock()
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned()
    }

    /// Write a document directly, bypassing faults and counters
    pub fn put_document(&self, collection: &str, id: &str, fields: Document) {
        self.state
            .lock()
            .documents
            .insert((collection.to_string(), id.to_string()), fields);
    }

    pub fn persistence(&self) -> PersistenceMode {
        self.state.lock().persistence
    }

    pub fn token_refreshes(&self) -> usize {
        self.counters.token_refreshes.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.counters.reloads.load(Ordering::SeqCst)
    }

    pub fn document_reads(&self) -> usize {
        self.counters.document_reads.load(Ordering::SeqCst)
    }

    pub fn document_writes(&self) -> usize {
        self.counters.document_writes.load(Ordering::SeqCst)
    }

    fn sign_in_as(&self, principal: Principal) -> Principal {
        self.state.lock().current = Some(principal.clone());
        debug!(uid = %principal.uid, "Principal signed in");
        let _ = self.auth_events.send(Some(principal.clone()));
        principal
    }

    fn check_online(&self, operation: &str) -> TypesyncResult<()> {
        if self.state.lock().offline {
            return Err(unavailable(operation));
        }
        Ok(())
    }
}

fn new_uid() -> String {
    format!("uid_{}", uuid::Uuid::new_v4().simple())
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

#[async_trait]
impl IdentityProvider for InMemoryBackend {
    async fn sign_in_with_credential(
        &self,
        email: &str,
        password: &str,
    ) -> TypesyncResult<Principal> {
        self.check_online("sign_in")?;
        if !looks_like_email(email) {
            return Err(provider_error(ProviderErrorCode::InvalidEmail));
        }

        let account = self
            .state
            .lock()
            .accounts
            .get(&email.to_lowercase())
            .cloned()
            .ok_or_else(|| provider_error(ProviderErrorCode::InvalidCredential))?;
        if account.disabled {
            return Err(provider_error(ProviderErrorCode::UserDisabled));
        }
        if account.password != password {
            return Err(provider_error(ProviderErrorCode::InvalidCredential));
        }

        Ok(self.sign_in_as(Principal {
            uid: account.uid,
            email: email.to_string(),
            display_name: account.display_name,
        }))
    }

    async fn create_principal(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> TypesyncResult<Principal> {
        self.check_online("create_principal")?;
        if !looks_like_email(email) {
            return Err(provider_error(ProviderErrorCode::InvalidEmail));
        }
        if password.chars().count() < 6 {
            return Err(provider_error(ProviderErrorCode::WeakPassword));
        }
        if self
            .state
            .lock()
            .accounts
            .contains_key(&email.to_lowercase())
        {
            return Err(provider_error(ProviderErrorCode::EmailAlreadyInUse));
        }

        let principal = self.register_account(email, password, display_name);
        Ok(self.sign_in_as(principal))
    }

    async fn sign_in_with_popup(&self, provider: ExternalProvider) -> TypesyncResult<Principal> {
        self.check_online("sign_in_with_popup")?;
        let principal = self
            .state
            .lock()
            .popup_principal
            .take()
            .ok_or_else(|| provider_error(ProviderErrorCode::PopupClosed))?;

        debug!(%provider, uid = %principal.uid, "Popup sign-in completed");
        Ok(self.sign_in_as(principal))
    }

    async fn sign_out(&self) -> TypesyncResult<()> {
        self.check_online("sign_out")?;
        let was_signed_in = self.state.lock().current.take().is_some();
        if was_signed_in {
            let _ = self.auth_events.send(None);
        }
        Ok(())
    }

    async fn get_fresh_token(&self, force_refresh: bool) -> TypesyncResult<AuthToken> {
        self.check_online("get_fresh_token")?;
        let fault = {
            let mut state = self.state.lock();
            if state.current.is_none() {
                return Err(provider_error(ProviderErrorCode::Unauthenticated));
            }
            if force_refresh {
                state.faults.token_refreshes.pop_front()
            } else {
                None
            }
        };
        if force_refresh {
            self.counters.token_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(fault) = fault {
            return Err(fault.into_error("get_fresh_token"));
        }

        Ok(AuthToken {
            value: uuid::Uuid::new_v4().simple().to_string(),
            expires_at: self.clock.now() + Duration::hours(1),
        })
    }

    async fn reload_principal(&self) -> TypesyncResult<()> {
        self.check_online("reload_principal")?;
        if self.state.lock().current.is_none() {
            return Err(provider_error(ProviderErrorCode::Unauthenticated));
        }
        self.counters.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn current_principal(&self) -> Option<Principal> {
        self.state.lock().current.clone()
    }

    async fn set_persistence(&self, mode: PersistenceMode) -> TypesyncResult<()> {
        self.state.lock().persistence = mode;
        Ok(())
    }

    fn auth_state_changes(&self) -> broadcast::Receiver<Option<Principal>> {
        self.auth_events.subscribe()
    }
}

#[async_trait]
impl DocumentStore for InMemoryBackend {
    async fn get_document(&self, collection: &str, id: &str) -> TypesyncResult<Option<Document>> {
        self.check_online("get_document")?;
        self.counters.document_reads.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(fault) = state.faults.reads.pop_front() {
            return Err(fault.into_error("get_document"));
        }
        Ok(state
            .documents
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: Document,
        merge: bool,
    ) -> TypesyncResult<()> {
        self.check_online("set_document")?;
        self.counters.document_writes.fetch_add(1, Ordering::SeqCst);

        let mut state = self.state.lock();
        if let Some(fault) = state.faults.writes.pop_front() {
            return Err(fault.into_error("set_document"));
        }

        let key = (collection.to_string(), id.to_string());
        match state.documents.get_mut(&key) {
            Some(existing) if merge => existing.extend(fields),
            _ => {
                state.documents.insert(key, fields);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_credential_errors() {
        let backend = InMemoryBackend::with_system_clock();
        backend.register_account("ada@example.com", "secret1", None);

        let wrong = backend
            .sign_in_with_credential("ada@example.com", "nope")
            .await
            .unwrap_err();
        assert_eq!(wrong.provider_code(), Some(ProviderErrorCode::InvalidCredential));

        let weak = backend
            .create_principal("bob@example.com", "123", None)
            .await
            .unwrap_err();
        assert_eq!(weak.provider_code(), Some(ProviderErrorCode::WeakPassword));

        let taken = backend
            .create_principal("ada@example.com", "secret1", None)
            .await
            .unwrap_err();
        assert_eq!(taken.provider_code(), Some(ProviderErrorCode::EmailAlreadyInUse));

        backend.disable_account("ada@example.com");
        let disabled = backend
            .sign_in_with_credential("ada@example.com", "secret1")
            .await
            .unwrap_err();
        assert_eq!(disabled.provider_code(), Some(ProviderErrorCode::UserDisabled));
    }

    #[tokio::test]
    async fn test_merge_write_keeps_other_fields() {
        let backend = InMemoryBackend::with_system_clock();
        let mut first = Document::new();
        first.insert("a".into(), 1.into());
        first.insert("b".into(), 2.into());
        backend.set_document("users", "u1", first, false).await.unwrap();

        let mut patch = Document::new();
        patch.insert("b".into(), 3.into());
        backend.set_document("users", "u1", patch, true).await.unwrap();

        let doc = backend.document("users", "u1").unwrap();
        assert_eq!(doc["a"], 1);
        assert_eq!(doc["b"], 3);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let backend = InMemoryBackend::with_system_clock();
        backend.fail_document_reads(1, Fault::PermissionDenied);

        let err = backend.get_document("users", "u1").await.unwrap_err();
        assert!(err.is_permission_error());
        assert!(backend.get_document("users", "u1").await.unwrap().is_none());
        assert_eq!(backend.document_reads(), 2);
    }

    #[tokio::test]
    async fn test_token_requires_principal() {
        let backend = InMemoryBackend::with_system_clock();
        assert!(backend.get_fresh_token(true).await.is_err());

        backend
            .create_principal("cy@example.com", "secret1", Some("Cy"))
            .await
            .unwrap();
        assert!(backend.get_fresh_token(true).await.is_ok());
        assert_eq!(backend.token_refreshes(), 1);
    }
}
