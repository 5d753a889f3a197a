//! Auth Context Orchestrator
//!
//! The single entry point the UI layer talks to. Owns the tab's active
//! identity and wires the session manager, the auth-state synchronizer and
//! the entitlement bus together. State is published on a watch channel,
//! one-time messages on a broadcast channel of notices.

use super::state::{AuthState, Notice, PendingUpgrade, PostAuthAction, UpgradeOutcome};
use crate::auth::{AuthStateSynchronizer, CrossTabSyncHandle, Identity, ProfileStore, UserProfile};
use crate::entitlement::{BusEvent, EntitlementBus, EntitlementReconciler, TransportSelection};
use crate::fingerprint::DeviceFingerprint;
use crate::remote::InMemoryBackend;
use crate::runtime::{EnvironmentEvent, TabEnvironment};
use crate::session::{
    ActivityTracker, DeviceRecord, SessionConfig, SessionConfigUpdate, SessionEvent,
    SessionManager, SessionRecord,
};
use crate::store::{keys, DurableQueue, SecureStore, StorageChanges};
use crate::{ClientError, ClientResult};
use chrono::Duration;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};
use typesync_core::{
    DocumentStore, EntitlementRecord, ExternalProvider, IdentityProvider, PersistenceMode,
    Principal, SharedClock, SubscriptionTier, TaskGroup, TypesyncConfig,
};

/// Collaborators of one tab's auth context
pub struct AuthContextDeps {
    pub tab: TabEnvironment,
    pub provider: Arc<dyn IdentityProvider>,
    pub documents: Arc<dyn DocumentStore>,
    pub clock: SharedClock,
    pub config: TypesyncConfig,
    pub transports: TransportSelection,
}

impl AuthContextDeps {
    /// Deps backed by one in-memory remote for both identity and documents
    pub fn in_memory(
        tab: TabEnvironment,
        backend: Arc<InMemoryBackend>,
        clock: SharedClock,
        config: TypesyncConfig,
    ) -> Self {
        Self {
            tab,
            provider: backend.clone(),
            documents: backend,
            clock,
            config,
            transports: TransportSelection::all(),
        }
    }

    pub fn with_transports(mut self, transports: TransportSelection) -> Self {
        self.transports = transports;
        self
    }
}

struct ContextInner {
    tab: TabEnvironment,
    provider: Arc<dyn IdentityProvider>,
    config: TypesyncConfig,
    clock: SharedClock,
    session: Arc<SessionManager>,
    sync: Arc<AuthStateSynchronizer>,
    profiles: ProfileStore,
    bus: EntitlementBus,
    reconciler: EntitlementReconciler,
    pending_upgrades: DurableQueue<PendingUpgrade>,
    post_auth_actions: DurableQueue<PostAuthAction>,
    state: watch::Sender<AuthState>,
    notices: broadcast::Sender<Notice>,
    cross_tab: Mutex<Option<CrossTabSyncHandle>>,
    tasks: TaskGroup,
}

/// Auth orchestrator for one tab
#[derive(Clone)]
pub struct AuthContext {
    inner: Arc<ContextInner>,
}

fn upgrade(weak: &Weak<ContextInner>) -> Option<AuthContext> {
    weak.upgrade().map(|inner| AuthContext { inner })
}

impl AuthContext {
    /// Build the context, restore any stored session and start background work
    pub async fn start(deps: AuthContextDeps) -> ClientResult<Self> {
        let AuthContextDeps {
            tab,
            provider,
            documents,
            clock,
            config,
            transports,
        } = deps;
        config.validate()?;

        let session = Arc::new(SessionManager::new(
            &tab,
            Arc::clone(&provider),
            Arc::clone(&clock),
            &config.session,
        ));
        let sync = Arc::new(AuthStateSynchronizer::new(
            Arc::clone(&provider),
            tab.durable_store().clone(),
            Arc::clone(&clock),
            config.retry.clone(),
        ));
        let profiles = ProfileStore::new(documents);
        let bus = EntitlementBus::for_tab(
            &tab,
            transports,
            &config.entitlement,
            Arc::clone(&sync),
            profiles.clone(),
            Arc::clone(&clock),
        )?;
        let reconciler =
            EntitlementReconciler::new(bus.clone(), config.entitlement.reconcile_interval());

        let pending_upgrades = DurableQueue::new(
            SecureStore::new(tab.durable_store().clone(), Arc::clone(&clock)),
            keys::PENDING_UPGRADES,
            Duration::hours(config.queue.upgrade_retry_ttl_hours),
            Arc::clone(&clock),
        );
        let post_auth_actions = DurableQueue::new(
            SecureStore::new(tab.session_store().clone(), Arc::clone(&clock)),
            keys::PENDING_ACTIONS,
            Duration::minutes(config.queue.post_auth_action_ttl_minutes),
            Arc::clone(&clock),
        );

        let (state, _) = watch::channel(AuthState::starting());
        let (notices, _) = broadcast::channel(64);

        // Subscribe before restoring so nothing emitted meanwhile is missed
        let auth_changes = provider.auth_state_changes();
        let session_changes = tab.durable_store().changes();
        let session_events = session.subscribe();
        let bus_events = bus.subscribe();
        let focus_events = tab.environment_events();
        let activity_events = tab.environment_events();
        let reconcile_events = tab.environment_events();

        let context = Self {
            inner: Arc::new(ContextInner {
                tab,
                provider,
                config,
                clock,
                session,
                sync,
                profiles,
                bus,
                reconciler,
                pending_upgrades,
                post_auth_actions,
                state,
                notices,
                cross_tab: Mutex::new(None),
                tasks: TaskGroup::new(),
            }),
        };

        let cross_tab = context.inner.sync.setup_cross_tab_sync();
        *context.inner.cross_tab.lock() = Some(cross_tab);

        context.restore_session().await;

        context.spawn_auth_listener(auth_changes);
        context.spawn_session_watcher(session_changes);
        context.spawn_session_notices(session_events);
        context.spawn_bus_listener(bus_events);
        context.spawn_focus_handler(focus_events);

        let tracker = ActivityTracker::new(std::time::Duration::from_secs(
            context.inner.config.session.activity_throttle_secs,
        ));
        context
            .inner
            .tasks
            .adopt(tracker.spawn(Arc::clone(&context.inner.session), activity_events));
        context.inner.reconciler.start(reconcile_events);

        context.drain_pending_upgrades().await;
        context.set_loading(false);

        let identity = context.identity();
        info!(
            tab = %context.inner.tab.id(),
            user_id = identity.uid(),
            "Auth context started"
        );
        Ok(context)
    }

    // ============================================================================
    // Observation
    // ============================================================================

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn identity(&self) -> Identity {
        self.inner.state.borrow().identity.clone()
    }

    pub fn entitlement(&self) -> EntitlementRecord {
        self.inner.state.borrow().identity.entitlement().clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    pub fn tab(&self) -> &TabEnvironment {
        &self.inner.tab
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.inner.session
    }

    pub fn auth_sync(&self) -> &Arc<AuthStateSynchronizer> {
        &self.inner.sync
    }

    pub fn bus(&self) -> &EntitlementBus {
        &self.inner.bus
    }

    pub fn reconciler(&self) -> &EntitlementReconciler {
        &self.inner.reconciler
    }

    /// Upgrades still waiting for the remote
    pub fn pending_upgrade_count(&self) -> usize {
        self.inner.pending_upgrades.len()
    }

    // ============================================================================
    // Authentication
    // ============================================================================

    /// Email/password sign-in
    pub async fn sign_in(
        &self,
        email: &str,
        password: &str,
        trusted_device: bool,
    ) -> ClientResult<UserProfile> {
        self.set_loading(true);
        let result = self
            .sign_in_with_password(email, password, trusted_device)
            .await;
        self.finish_attempt(result).await
    }

    /// Register and sign in a new principal on the free plan
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> ClientResult<UserProfile> {
        self.set_loading(true);
        let result = self.register(email, password, display_name).await;
        self.finish_attempt(result).await
    }

    /// Federated sign-in through the provider's popup
    pub async fn sign_in_with_external_provider(
        &self,
        provider: ExternalProvider,
    ) -> ClientResult<UserProfile> {
        self.set_loading(true);
        let result = self.sign_in_with_popup(provider).await;
        self.finish_attempt(result).await
    }

    /// Clear the session everywhere and fall back to the guest
    pub async fn sign_out(&self) {
        let user_id = self.identity().uid().to_string();
        self.install_guest();
        self.inner.session.clear_session().await;
        if let Err(e) = self.inner.sync.broadcast_auth_change() {
            warn!(error = %e, "Failed to signal sign-out to other tabs");
        }
        info!(user_id = %user_id, "Signed out");
    }

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
        trusted_device: bool,
    ) -> ClientResult<UserProfile> {
        let mode = if trusted_device {
            PersistenceMode::Durable
        } else {
            PersistenceMode::Session
        };
        self.inner.provider.set_persistence(mode).await?;

        let principal = self
            .inner
            .provider
            .sign_in_with_credential(email, password)
            .await?;

        let settings = &self.inner.config.session;
        let days = if trusted_device {
            settings.trusted_duration_days
        } else {
            settings.default_duration_days
        };
        self.inner
            .session
            .create_session(&principal, SessionConfig::for_sign_in(trusted_device, days))
            .await?;

        let profile = self.load_identity(&principal).await;
        Ok(self.complete_authentication(profile).await)
    }

    async fn register(
        &self,
        email: &str,
        password: &str,
        display_name: Option<&str>,
    ) -> ClientResult<UserProfile> {
        let principal = self
            .inner
            .provider
            .create_principal(email, password, display_name)
            .await?;

        let config =
            SessionConfig::for_sign_in(false, self.inner.config.session.default_duration_days);
        self.inner.session.create_session(&principal, config).await?;

        let profile = UserProfile::new_default(&principal, self.inner.clock.now());
        if let Err(e) = self.inner.profiles.save_profile(&profile).await {
            warn!(user_id = %principal.uid, error = %e, "Failed to create profile, continuing with local default");
        }

        Ok(self.complete_authentication(profile).await)
    }

    async fn sign_in_with_popup(&self, provider: ExternalProvider) -> ClientResult<UserProfile> {
        self.inner
            .provider
            .set_persistence(PersistenceMode::Durable)
            .await?;
        let principal = self.inner.provider.sign_in_with_popup(provider).await?;

        let config = SessionConfig {
            remember_me: true,
            ..SessionConfig::for_sign_in(false, self.inner.config.session.default_duration_days)
        };
        self.inner.session.create_session(&principal, config).await?;

        let profile = self.load_identity(&principal).await;
        Ok(self.complete_authentication(profile).await)
    }

    async fn finish_attempt(&self, result: ClientResult<UserProfile>) -> ClientResult<UserProfile> {
        match result {
            Ok(profile) => Ok(profile),
            Err(e) => {
                if let Err(reset) = self
                    .inner
                    .provider
                    .set_persistence(PersistenceMode::Session)
                    .await
                {
                    warn!(error = %reset, "Failed to reset credential persistence");
                }
                self.set_loading(false);
                warn!(error = %e, "Authentication failed");
                Err(e.into_user_facing())
            }
        }
    }

    async fn complete_authentication(&self, profile: UserProfile) -> UserProfile {
        info!(user_id = %profile.uid, tier = %profile.subscription.tier, "Signed in");
        self.install_principal(profile.clone());

        if let Err(e) = self.inner.sync.broadcast_auth_change() {
            warn!(error = %e, "Failed to signal sign-in to other tabs");
        }

        self.replay_post_auth_actions().await;
        self.drain_pending_upgrades().await;

        self.identity().profile().cloned().unwrap_or(profile)
    }

    /// Profile for `principal`: stored, freshly created, or synthesized when
    /// the read fails
    async fn load_identity(&self, principal: &Principal) -> UserProfile {
        let now = self.inner.clock.now();
        let profiles = self.inner.profiles.clone();
        let uid = principal.uid.clone();

        let loaded = self
            .inner
            .sync
            .retry_with_auth_sync("load_profile", move || {
                let profiles = profiles.clone();
                let uid = uid.clone();
                async move { profiles.load_profile(&uid).await }
            })
            .await;

        match loaded {
            Ok(Some(mut profile)) => {
                profile.last_login_at = now;
                if let Err(e) = self.inner.profiles.save_identity_fields(&profile).await {
                    warn!(user_id = %profile.uid, error = %e, "Failed to record login time");
                }
                profile
            }
            Ok(None) => {
                let profile = UserProfile::new_default(principal, now);
                if let Err(e) = self.inner.profiles.save_profile(&profile).await {
                    warn!(user_id = %profile.uid, error = %e, "Failed to create missing profile");
                }
                profile
            }
            Err(e) => {
                warn!(user_id = %principal.uid, error = %e, "Profile load failed, using default profile");
                let profile = UserProfile::new_default(principal, now);

                let profiles = self.inner.profiles.clone();
                let background = profile.clone();
                self.inner.tasks.spawn(async move {
                    if let Err(e) = profiles.save_identity_fields(&background).await {
                        warn!(user_id = %background.uid, error = %e, "Background profile save failed");
                    }
                });
                profile
            }
        }
    }

    // ============================================================================
    // Entitlement
    // ============================================================================

    /// Move the signed-in user up to `tier`
    pub async fn upgrade_entitlement(&self, tier: SubscriptionTier) -> ClientResult<UpgradeOutcome> {
        self.ensure_live_session();
        let identity = self.identity();
        let Some(profile) = identity.profile() else {
            self.inner
                .post_auth_actions
                .enqueue(PostAuthAction::Upgrade { tier })?;
            self.notify(Notice::info(format!(
                "Sign in to continue your {} upgrade.",
                tier
            )));
            return Ok(UpgradeOutcome::Deferred);
        };
        let user_id = profile.uid.clone();

        let canonical = match self.inner.bus.fetch_canonical(&user_id).await {
            Ok(Some(remote)) => {
                self.apply_entitlement(&user_id, remote.clone());
                remote
            }
            Ok(None) => profile.subscription.clone(),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Could not refetch entitlement, using cached copy");
                self.inner
                    .bus
                    .cached()
                    .unwrap_or_else(|| profile.subscription.clone())
            }
        };

        if canonical.covers(tier) {
            debug!(user_id = %user_id, current = %canonical.tier, requested = %tier, "Upgrade not needed");
            self.notify(Notice::info(format!(
                "You already have the {} plan.",
                canonical.tier
            )));
            return Ok(UpgradeOutcome::AlreadyEntitled(canonical.tier));
        }

        let record = EntitlementRecord::for_tier(tier, self.inner.clock.now());
        self.apply_entitlement(&user_id, record.clone());

        match self.write_entitlement(&user_id, &record).await {
            Ok(()) => {
                let report = self.inner.bus.publish(&user_id, tier);
                if report.all_failed() {
                    warn!(user_id = %user_id, "No transport delivered the upgrade, other tabs will catch up on poll");
                }
                info!(user_id = %user_id, %tier, "Entitlement upgraded");
                Ok(UpgradeOutcome::Upgraded(record))
            }
            Err(e) => {
                warn!(user_id = %user_id, %tier, error = %e, "Upgrade write failed, queued for retry");
                self.inner.pending_upgrades.enqueue(PendingUpgrade {
                    user_id: user_id.clone(),
                    record: record.clone(),
                })?;
                self.inner.bus.hold(&user_id, record.clone());
                self.notify(Notice::info(
                    "Your upgrade is active here and will finish syncing once the connection recovers.",
                ));
                Ok(UpgradeOutcome::Queued(record))
            }
        }
    }

    /// Upgrade through a promotional code
    pub async fn redeem_code(&self, code: &str) -> ClientResult<UpgradeOutcome> {
        let tier = self
            .inner
            .config
            .redeem_tier(code)
            .ok_or_else(|| ClientError::validation("Invalid or expired code."))?;
        info!(%tier, "Redeeming code");
        self.upgrade_entitlement(tier).await
    }

    async fn write_entitlement(&self, user_id: &str, record: &EntitlementRecord) -> ClientResult<()> {
        let profiles = self.inner.profiles.clone();
        let uid = user_id.to_string();
        let record = record.clone();

        self.inner
            .sync
            .retry_with_auth_sync("write_entitlement", move || {
                let profiles = profiles.clone();
                let uid = uid.clone();
                let record = record.clone();
                async move { profiles.write_entitlement(&uid, &record).await }
            })
            .await
    }

    /// Retry queued upgrades of the active user
    async fn drain_pending_upgrades(&self) {
        let Some(user_id) = self.inner.bus.active_user() else {
            return;
        };
        let tasks = self.inner.pending_upgrades.drain();
        if tasks.is_empty() {
            self.inner.bus.release(&user_id);
            return;
        }

        let (mine, mut keep): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .partition(|task| task.payload.user_id == user_id);

        if !mine.is_empty() {
            match self.inner.bus.fetch_canonical(&user_id).await {
                Err(e) => {
                    warn!(user_id = %user_id, error = %e, "Cannot check queued upgrades yet");
                    keep.extend(mine);
                }
                Ok(remote) => {
                    let mut current = remote.map(|record| record.tier).unwrap_or_default();
                    for task in mine {
                        let record = task.payload.record.clone();
                        if current >= record.tier {
                            debug!(user_id = %user_id, tier = %record.tier, "Queued upgrade already applied");
                            continue;
                        }
                        match self.write_entitlement(&user_id, &record).await {
                            Ok(()) => {
                                current = record.tier;
                                info!(user_id = %user_id, tier = %record.tier, "Queued upgrade synced");
                                self.apply_entitlement(&user_id, record.clone());
                                self.inner.bus.publish(&user_id, record.tier);
                            }
                            Err(e) => {
                                warn!(user_id = %user_id, error = %e, "Queued upgrade still failing");
                                keep.push(task);
                            }
                        }
                    }
                }
            }
        }

        let still_queued = keep
            .iter()
            .filter(|task| task.payload.user_id == user_id)
            .map(|task| task.payload.record.clone())
            .max_by_key(|record| record.tier);
        match still_queued {
            Some(record) => {
                self.inner.bus.hold(&user_id, record);
                if let Some(cached) = self.inner.bus.cached_for(&user_id) {
                    self.apply_entitlement(&user_id, cached);
                }
            }
            None => self.inner.bus.release(&user_id),
        }

        if let Err(e) = self.inner.pending_upgrades.restore(keep) {
            warn!(error = %e, "Failed to requeue pending upgrades");
        }
    }

    async fn replay_post_auth_actions(&self) {
        for task in self.inner.post_auth_actions.drain() {
            match task.payload {
                PostAuthAction::Upgrade { tier } => match self.upgrade_entitlement(tier).await {
                    Ok(outcome) => debug!(?outcome, "Replayed deferred upgrade"),
                    Err(e) => warn!(%tier, error = %e, "Deferred upgrade failed"),
                },
            }
        }
    }

    fn apply_entitlement(&self, user_id: &str, record: EntitlementRecord) {
        self.inner.bus.set_cached(user_id, record.clone());
        self.inner
            .state
            .send_if_modified(|state| match &mut state.identity {
                Identity::Principal(profile)
                    if profile.uid == user_id && profile.subscription != record =>
                {
                    profile.subscription = record;
                    true
                }
                _ => false,
            });
    }

    // ============================================================================
    // Session and device trust
    // ============================================================================

    pub fn session_config(&self) -> SessionConfig {
        self.inner.session.session_config()
    }

    pub async fn update_session_config(
        &self,
        update: SessionConfigUpdate,
    ) -> ClientResult<SessionConfig> {
        self.inner.session.update_session_config(update).await
    }

    pub async fn extend_session(&self) -> ClientResult<SessionRecord> {
        self.inner.session.extend_session().await
    }

    pub fn session_time_remaining(&self) -> Option<Duration> {
        if !self.ensure_live_session() {
            return None;
        }
        self.inner.session.time_remaining()
    }

    pub fn is_device_trusted(&self) -> bool {
        self.inner.session.is_device_trusted()
    }

    pub fn add_trusted_device(&self, nickname: Option<String>) -> ClientResult<DeviceRecord> {
        self.inner.session.add_trusted_device(nickname)
    }

    pub fn remove_trusted_device(&self, fingerprint: &DeviceFingerprint) -> ClientResult<bool> {
        self.inner.session.remove_trusted_device(fingerprint)
    }

    pub fn trusted_devices(&self) -> Vec<DeviceRecord> {
        self.inner.session.trusted_devices()
    }

    /// Stop all background work of this tab
    pub fn shutdown(&self) {
        self.inner.tasks.abort_all();
        self.inner.reconciler.stop();
        self.inner.bus.stop();
        self.inner.cross_tab.lock().take();
        debug!(tab = %self.inner.tab.id(), "Auth context shut down");
    }

    // ============================================================================
    // Identity transitions
    // ============================================================================

    async fn restore_session(&self) {
        if !self.inner.session.validate_existing_session().await {
            self.install_guest();
            return;
        }
        let Some(record) = self.inner.session.current_session() else {
            self.install_guest();
            return;
        };

        match self.inner.provider.current_principal() {
            Some(principal) if record.is_owned_by(&principal) => {
                let profile = self.load_identity(&principal).await;
                info!(user_id = %profile.uid, "Session restored");
                self.install_principal(profile);
            }
            Some(principal) => {
                warn!(
                    session_user = %record.user_id,
                    principal = %principal.uid,
                    "Stored session belongs to another principal"
                );
                self.inner.session.clear_local();
                self.install_guest();
            }
            None => {
                debug!(user_id = %record.user_id, "Stored session has no signed-in principal yet");
                self.install_guest();
            }
        }
    }

    /// Take over a principal that signed in elsewhere, if this profile holds
    /// a valid session for it
    async fn adopt_remote_principal(&self, principal: &Principal) {
        {
            let state = self.inner.state.borrow();
            if state.loading || !state.identity.is_guest() {
                return;
            }
        }

        let owned = self
            .inner
            .session
            .current_session()
            .map(|record| record.is_owned_by(principal))
            .unwrap_or(false);
        if !owned || !self.inner.session.validate_existing_session().await {
            return;
        }

        let profile = self.load_identity(principal).await;
        if !self.identity().is_guest() {
            return;
        }
        info!(user_id = %profile.uid, "Adopted session from another tab");
        self.install_principal(profile);
    }

    fn fall_back_to_guest(&self, reason: &str) {
        {
            let state = self.inner.state.borrow();
            if state.loading || state.identity.is_guest() {
                return;
            }
        }
        info!(reason, "Signed out elsewhere, switching to guest");
        self.inner.session.clear_local();
        self.install_guest();
    }

    /// Whether a signed-in identity still has a usable session; switches to
    /// guest when it does not
    fn ensure_live_session(&self) -> bool {
        if self.identity().is_guest() {
            return false;
        }
        if self.inner.session.live_record().is_some() {
            return true;
        }
        self.fall_back_to_guest("session expired");
        false
    }

    /// The expiry watcher fired. A newer session may have replaced the
    /// watched one, so the stored record decides.
    async fn handle_session_expired(&self) {
        if self.identity().is_guest() || self.inner.session.validate_existing_session().await {
            return;
        }
        info!(tab = %self.inner.tab.id(), "Session expired, switching to guest");
        self.install_guest();
    }

    fn install_principal(&self, profile: UserProfile) {
        self.inner
            .bus
            .activate(&profile.uid, profile.subscription.clone());
        self.inner.state.send_replace(AuthState {
            identity: Identity::Principal(profile),
            loading: false,
        });
    }

    fn install_guest(&self) {
        self.inner.bus.deactivate();
        self.inner.state.send_replace(AuthState {
            identity: Identity::guest(),
            loading: false,
        });
    }

    fn set_loading(&self, loading: bool) {
        self.inner.state.send_if_modified(|state| {
            if state.loading == loading {
                return false;
            }
            state.loading = loading;
            true
        });
    }

    fn notify(&self, notice: Notice) {
        debug!(level = ?notice.level, text = %notice.message, "Notice");
        let _ = self.inner.notices.send(notice);
    }

    // ============================================================================
    // Background listeners
    // ============================================================================

    fn spawn_auth_listener(&self, mut changes: broadcast::Receiver<Option<Principal>>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            loop {
                let change = match changes.recv().await {
                    Ok(change) => change,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(context) = upgrade(&weak) else { break };
                match change {
                    None => context.fall_back_to_guest("remote sign-out"),
                    Some(principal) => context.adopt_remote_principal(&principal).await,
                }
            }
        });
    }

    fn spawn_session_watcher(&self, mut changes: StorageChanges) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            while let Some(change) = changes.recv_key(keys::SESSION).await {
                let Some(context) = upgrade(&weak) else { break };
                if change.new_value.is_none() {
                    context.fall_back_to_guest("session cleared in another tab");
                    continue;
                }
                if let Some(principal) = context.inner.provider.current_principal() {
                    context.adopt_remote_principal(&principal).await;
                }
            }
        });
    }

    fn spawn_session_notices(&self, mut events: broadcast::Receiver<SessionEvent>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(context) = upgrade(&weak) else { break };
                match event {
                    SessionEvent::ExpiryWarning { expires_at } => {
                        let minutes = (expires_at - context.inner.clock.now())
                            .num_minutes()
                            .max(1);
                        context.notify(Notice::warning(format!(
                            "Your session expires in {} minutes. Extend it to stay signed in.",
                            minutes
                        )));
                    }
                    SessionEvent::Expired { .. } => context.handle_session_expired().await,
                    _ => {}
                }
            }
        });
    }

    fn spawn_bus_listener(&self, mut events: broadcast::Receiver<BusEvent>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(context) = upgrade(&weak) else { break };
                // Events can trail later local writes; the cache holds the latest
                if let Some(record) = context.inner.bus.cached_for(event.user_id()) {
                    context.apply_entitlement(event.user_id(), record);
                }
                if let BusEvent::Refreshed { current, .. } = &event {
                    context.notify(Notice::info(format!(
                        "Your plan was updated to {}.",
                        current.tier
                    )));
                }
            }
        });
    }

    fn spawn_focus_handler(&self, mut events: broadcast::Receiver<EnvironmentEvent>) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.tasks.spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !event.is_focus_regain() {
                    continue;
                }
                let Some(context) = upgrade(&weak) else { break };
                context.drain_pending_upgrades().await;
            }
        });
    }
}
