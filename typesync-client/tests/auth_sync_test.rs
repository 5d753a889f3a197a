//! Auth-state synchronizer: retry-with-resync, single-flight and cross-tab signals

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use typesync_client::{
    AuthStateSynchronizer, BrowserProfile, ClientError, EnvironmentSignals, Fault,
    InMemoryBackend, SyncPhase,
};
use typesync_core::{
    AuthToken, ExternalProvider, IdentityProvider, ManualClock, PersistenceMode, Principal,
    ProviderErrorCode, RetrySettings, TypesyncError, TypesyncResult,
};

/// Provider whose forced refreshes take a while, so concurrent syncs overlap
struct SlowRefresh {
    inner: Arc<InMemoryBackend>,
    delay: Duration,
}

#[async_trait]
impl IdentityProvider for SlowRefresh {
    async fn sign_in_with_credential(&self, email: &str, password: &str) -> TypesyncResult<Principal> {
        self.inner.sign_in_with_credential(email, password).await
    }

    async fn create_principal(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> TypesyncResult<Principal> {
        self.inner.create_principal(email, password, display_name).await
    }

    async fn sign_in_with_popup(&self, provider: ExternalProvider) -> TypesyncResult<Principal> {
        self.inner.sign_in_with_popup(provider).await
    }

    async fn sign_out(&self) -> TypesyncResult<()> {
        self.inner.sign_out().await
    }

    async fn get_fresh_token(&self, force_refresh: bool) -> TypesyncResult<AuthToken> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_fresh_token(force_refresh).await
    }

    async fn reload_principal(&self) -> TypesyncResult<()> {
        self.inner.reload_principal().await
    }

    fn current_principal(&self) -> Option<Principal> {
        self.inner.current_principal()
    }

    async fn set_persistence(&self, mode: PersistenceMode) -> TypesyncResult<()> {
        self.inner.set_persistence(mode).await
    }

    fn auth_state_changes(&self) -> broadcast::Receiver<Option<Principal>> {
        self.inner.auth_state_changes()
    }
}

fn permission_denied() -> ClientError {
    ClientError::Core(TypesyncError::provider(
        ProviderErrorCode::PermissionDenied,
        "Missing or insufficient permissions.",
        "test",
    ))
}

async fn signed_in_backend(clock: &ManualClock) -> Arc<InMemoryBackend> {
    let backend = InMemoryBackend::new(Arc::new(clock.clone()));
    backend
        .create_principal("ada@example.com", "analytical", Some("Ada"))
        .await
        .unwrap();
    backend
}

fn synchronizer(profile: &BrowserProfile, provider: Arc<dyn IdentityProvider>) -> Arc<AuthStateSynchronizer> {
    let tab = profile.open_tab(EnvironmentSignals::default());
    Arc::new(AuthStateSynchronizer::new(
        provider,
        tab.durable_store().clone(),
        Arc::new(ManualClock::default()),
        RetrySettings::default(),
    ))
}

#[tokio::test(start_paused = true)]
async fn test_permission_failure_then_success() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let sync = synchronizer(&BrowserProfile::in_memory(), backend.clone());

    let attempts = AtomicU32::new(0);
    let result = sync
        .retry_with_auth_sync("load_profile", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(permission_denied())
            } else {
                Ok(42)
            }
        })
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(sync.sync_count(), 1);
    assert_eq!(backend.reloads(), 1);
    assert_eq!(sync.phase(), SyncPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_other_failures_are_not_retried() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let sync = synchronizer(&BrowserProfile::in_memory(), backend);

    let attempts = AtomicU32::new(0);
    let result: Result<(), _> = sync
        .retry_with_auth_sync("load_profile", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::validation("bad input"))
        })
        .await;

    assert!(matches!(result, Err(ClientError::Validation { .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(sync.sync_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_at_limit() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let sync = synchronizer(&BrowserProfile::in_memory(), backend);

    let attempts = AtomicU32::new(0);
    let started = tokio::time::Instant::now();
    let result: Result<(), _> = sync
        .retry_with_auth_sync("write_entitlement", || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(permission_denied())
        })
        .await;

    assert!(result.unwrap_err().is_permission_error());
    // One initial attempt plus two retries, one second apart
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(sync.sync_count(), 2);
    assert!(started.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn test_stale_credential_synced_before_attempt() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let sync = synchronizer(&BrowserProfile::in_memory(), backend.clone());

    backend.fail_token_refreshes(1, Fault::PermissionDenied);
    let result = sync
        .retry_with_auth_sync("load_profile", || async { Ok::<_, ClientError>("profile") })
        .await;

    assert_eq!(result.unwrap(), "profile");
    assert_eq!(sync.sync_count(), 1);
}

#[tokio::test]
async fn test_auth_state_invalid_without_principal() {
    let backend = InMemoryBackend::new(Arc::new(ManualClock::default()));
    let sync = synchronizer(&BrowserProfile::in_memory(), backend.clone());

    assert!(!sync.is_auth_state_valid().await);
    assert!(sync.sync_auth_state().await.is_err());
    assert_eq!(sync.phase(), SyncPhase::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_syncs_share_one_run() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let provider = Arc::new(SlowRefresh {
        inner: backend.clone(),
        delay: Duration::from_millis(200),
    });
    let sync = synchronizer(&BrowserProfile::in_memory(), provider);

    let (first, second, third) = tokio::join!(
        sync.sync_auth_state(),
        sync.sync_auth_state(),
        sync.sync_auth_state()
    );
    assert!(first.is_ok() && second.is_ok() && third.is_ok());
    assert_eq!(sync.sync_count(), 1);
    assert_eq!(backend.reloads(), 1);
    assert!(!sync.is_syncing());

    // A later call starts a fresh run
    sync.sync_auth_state().await.unwrap();
    assert_eq!(sync.sync_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cross_tab_signal_triggers_resync() {
    let clock = ManualClock::default();
    let backend = signed_in_backend(&clock).await;
    let profile = BrowserProfile::in_memory();
    let sender = synchronizer(&profile, backend.clone());
    let receiver = synchronizer(&profile, backend.clone());

    let handle = receiver.setup_cross_tab_sync();
    assert!(handle.is_active());

    sender.broadcast_auth_change().unwrap();
    for _ in 0..50 {
        if receiver.sync_count() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(receiver.sync_count(), 1);
    // The writer does not hear its own signal
    assert_eq!(sender.sync_count(), 0);

    handle.unsubscribe();
    sender.broadcast_auth_change().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(receiver.sync_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cross_tab_signal_ignored_when_signed_out() {
    let backend = InMemoryBackend::new(Arc::new(ManualClock::default()));
    let profile = BrowserProfile::in_memory();
    let sender = synchronizer(&profile, backend.clone());
    let receiver = synchronizer(&profile, backend);

    let _handle = receiver.setup_cross_tab_sync();
    sender.broadcast_auth_change().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(receiver.sync_count(), 0);
}
