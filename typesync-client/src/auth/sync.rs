//! Auth-State Synchronizer
//!
//! Guards remote calls against stale credentials. A forced token refresh
//! tells whether the credential is still accepted; a sync refreshes the
//! token and reloads the principal. Concurrent syncs within a tab share one
//! in-flight run, and a broadcast key lets a tab ask the others to resync
//! after it signs in or out.

use crate::runtime::TabId;
use crate::store::{keys, LocalStore};
use crate::{ClientError, ClientResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use typesync_core::{IdentityProvider, RetrySettings, SharedClock, SingleFlight};

/// Where the synchronizer is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Syncing,
    Failed,
}

/// Credential freshness guard for one tab
pub struct AuthStateSynchronizer {
    provider: Arc<dyn IdentityProvider>,
    /// Durable store; carries the cross-tab auth signal
    store: LocalStore,
    clock: SharedClock,
    retry: RetrySettings,
    flight: SingleFlight<Result<(), String>>,
    phase: Arc<Mutex<SyncPhase>>,
    runs: Arc<AtomicU64>,
}

impl AuthStateSynchronizer {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: LocalStore,
        clock: SharedClock,
        retry: RetrySettings,
    ) -> Self {
        Self {
            provider,
            store,
            clock,
            retry,
            flight: SingleFlight::new(),
            phase: Arc::new(Mutex::new(SyncPhase::Idle)),
            runs: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock()
    }

    pub fn is_syncing(&self) -> bool {
        self.flight.is_in_flight()
    }

    /// Number of sync runs actually executed (joined callers not counted)
    pub fn sync_count(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Whether a principal is signed in and its credential survives a forced refresh
    pub async fn is_auth_state_valid(&self) -> bool {
        if self.provider.current_principal().is_none() {
            return false;
        }
        match self.provider.get_fresh_token(true).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Credential refresh failed");
                false
            }
        }
    }

    /// Refresh the credential and reload the principal.
    ///
    /// Concurrent callers join the run already in flight.
    pub async fn sync_auth_state(&self) -> ClientResult<()> {
        let provider = Arc::clone(&self.provider);
        let phase = Arc::clone(&self.phase);
        let runs = Arc::clone(&self.runs);

        let outcome = self
            .flight
            .run(move || async move {
                *phase.lock() = SyncPhase::Syncing;
                runs.fetch_add(1, Ordering::SeqCst);
                debug!("Synchronizing auth state");

                let result = async {
                    provider.get_fresh_token(true).await?;
                    provider.reload_principal().await
                }
                .await;

                match result {
                    Ok(()) => {
                        *phase.lock() = SyncPhase::Idle;
                        debug!("Auth state synchronized");
                        Ok(())
                    }
                    Err(e) => {
                        *phase.lock() = SyncPhase::Failed;
                        warn!(error = %e, "Auth state sync failed");
                        Err(e.to_string())
                    }
                }
            })
            .await;

        outcome.map_err(|message| ClientError::AuthSync { message })
    }

    /// Run `operation`, resyncing credentials and retrying on permission
    /// failures up to the configured number of retries
    pub async fn retry_with_auth_sync<T, F, Fut>(&self, operation: &str, op: F) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        self.retry_with_auth_sync_limit(operation, self.retry.max_retries, op)
            .await
    }

    /// [`Self::retry_with_auth_sync`] with an explicit retry limit
    pub async fn retry_with_auth_sync_limit<T, F, Fut>(
        &self,
        operation: &str,
        max_retries: u32,
        mut op: F,
    ) -> ClientResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<T>>,
    {
        let mut attempt: u32 = 0;

        loop {
            if !self.is_auth_state_valid().await {
                debug!(operation, attempt, "Credential stale before attempt, syncing");
                if let Err(e) = self.sync_auth_state().await {
                    debug!(operation, error = %e, "Pre-attempt sync failed");
                }
            }

            match op().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(operation, attempt, "Operation recovered after auth resync");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_permission_error() && attempt < max_retries => {
                    attempt += 1;
                    warn!(operation, attempt, error = %e, "Permission failure, resyncing credentials");
                    if let Err(sync_err) = self.sync_auth_state().await {
                        warn!(operation, error = %sync_err, "Resync failed");
                    }
                    tokio::time::sleep(self.retry.delay()).await;
                }
                Err(e) => {
                    if e.is_permission_error() {
                        warn!(operation, attempts = attempt + 1, "Retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Resync whenever another tab signals an auth change
    pub fn setup_cross_tab_sync(self: &Arc<Self>) -> CrossTabSyncHandle {
        let mut changes = self.store.changes();
        let weak = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            while let Some(change) = changes.recv_key(keys::AUTH_SYNC_SIGNAL).await {
                let Some(sync) = weak.upgrade() else { break };
                if sync.provider.current_principal().is_none() {
                    debug!(origin = %change.origin, "Auth signal ignored, nobody signed in");
                    continue;
                }
                debug!(origin = %change.origin, "Auth change in another tab");
                if let Err(e) = sync.sync_auth_state().await {
                    warn!(error = %e, "Cross-tab auth sync failed");
                }
            }
        });

        CrossTabSyncHandle {
            handle: Some(handle),
        }
    }

    /// Tell the other tabs to resync their credentials
    pub fn broadcast_auth_change(&self) -> ClientResult<()> {
        let signal = serde_json::json!({
            "timestamp": self.clock.now(),
            "tab": self.store.tab(),
        });
        self.store
            .set_raw(keys::AUTH_SYNC_SIGNAL, &signal.to_string())
    }

    pub fn tab(&self) -> &TabId {
        self.store.tab()
    }
}

/// Stops the cross-tab listener when unsubscribed or dropped
pub struct CrossTabSyncHandle {
    handle: Option<JoinHandle<()>>,
}

impl CrossTabSyncHandle {
    pub fn is_active(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn unsubscribe(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for CrossTabSyncHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
