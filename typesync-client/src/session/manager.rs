//! Session Manager - device-aware session lifecycle
//!
//! Owns the persisted [`SessionRecord`] for one tab's profile: creation on
//! sign-in, validation on start-up, extension, expiry warnings and teardown.
//! Validation fails closed: anything doubtful yields "no session" and the
//! stored session keys are removed.

use super::devices::TrustedDevices;
use super::timer::ExpiryScheduler;
use super::types::{
    DeviceRecord, RejectionReason, SessionConfig, SessionConfigUpdate, SessionEvent, SessionRecord,
};
use crate::fingerprint::DeviceFingerprint;
use crate::runtime::TabEnvironment;
use crate::store::{keys, SecureStore};
use crate::{ClientError, ClientResult};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use typesync_core::{IdentityProvider, Principal, SessionSettings, SharedClock};

/// Session lifecycle manager for one tab
pub struct SessionManager {
    /// Durable, profile-wide secure store
    store: SecureStore,
    clock: SharedClock,
    provider: Arc<dyn IdentityProvider>,
    /// Fingerprint of the device this tab runs on
    fingerprint: DeviceFingerprint,
    user_agent_signature: String,
    devices: TrustedDevices,
    expiry: ExpiryScheduler,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(
        tab: &TabEnvironment,
        provider: Arc<dyn IdentityProvider>,
        clock: SharedClock,
        settings: &SessionSettings,
    ) -> Self {
        let store = SecureStore::new(tab.durable_store().clone(), Arc::clone(&clock));
        let (events, _) = broadcast::channel(32);

        Self {
            devices: TrustedDevices::new(store.clone()),
            expiry: ExpiryScheduler::new(
                Duration::minutes(settings.expiry_warning_minutes),
                Arc::clone(&clock),
                events.clone(),
            ),
            fingerprint: tab.fingerprint().clone(),
            user_agent_signature: tab.signals().user_agent_signature(),
            store,
            clock,
            provider,
            events,
        }
    }

    /// Lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Start a session for `principal`
    pub async fn create_session(
        &self,
        principal: &Principal,
        config: SessionConfig,
    ) -> ClientResult<SessionRecord> {
        validate_duration(config.session_duration_days)?;

        let now = self.clock.now();
        let record = SessionRecord {
            user_id: principal.uid.clone(),
            email: principal.email.clone(),
            display_name: principal.display_name.clone(),
            login_time: now,
            expires_at: now + config.duration(),
            device_fingerprint: self.fingerprint.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            last_activity: now,
        };

        self.save_record(&record)?;
        self.store.put(keys::SESSION_CONFIG, &config, None)?;

        if config.trusted_device {
            self.devices.trust(
                &self.fingerprint,
                self.user_agent_signature.clone(),
                None,
                now,
            )?;
        }

        self.expiry.schedule(record.expires_at, now);

        info!(
            user_id = %record.user_id,
            session_id = %record.session_id,
            expires_at = %record.expires_at,
            trusted = config.trusted_device,
            "Session created"
        );
        let _ = self.events.send(SessionEvent::Created {
            session_id: record.session_id.clone(),
            user_id: record.user_id.clone(),
            expires_at: record.expires_at,
        });

        Ok(record)
    }

    /// Check the stored session; clears it and returns false when it is
    /// missing, unreadable, expired or bound to an untrusted other device.
    pub async fn validate_existing_session(&self) -> bool {
        let had_raw = matches!(self.store.local().get_raw(keys::SESSION), Ok(Some(_)));
        let Some(mut record) = self.store.get::<SessionRecord>(keys::SESSION) else {
            if had_raw {
                self.reject(RejectionReason::Corrupt);
            } else {
                debug!("No stored session");
                self.clear_local();
            }
            return false;
        };

        let now = self.clock.now();
        if let Err(reason) = self.check_record(&record, now) {
            self.reject(reason);
            return false;
        }

        record.last_activity = now;
        if let Err(e) = self.save_record(&record) {
            warn!(error = %e, "Failed to refresh session activity");
        }
        self.expiry.schedule(record.expires_at, now);

        debug!(user_id = %record.user_id, expires_at = %record.expires_at, "Session validated");
        true
    }

    /// Push expiry out by the configured duration from now
    pub async fn extend_session(&self) -> ClientResult<SessionRecord> {
        let now = self.clock.now();
        let mut record = self
            .live_session(now)?
            .ok_or_else(|| ClientError::session("No active session to extend"))?;
        let config = self.session_config();

        record.expires_at = now + config.duration();
        record.last_activity = now;
        self.save_record(&record)?;
        self.expiry.schedule(record.expires_at, now);

        info!(user_id = %record.user_id, expires_at = %record.expires_at, "Session extended");
        let _ = self.events.send(SessionEvent::Extended {
            expires_at: record.expires_at,
        });

        Ok(record)
    }

    /// Merge `update` into the stored config; a changed duration re-derives
    /// the live session's expiry from now.
    pub async fn update_session_config(
        &self,
        update: SessionConfigUpdate,
    ) -> ClientResult<SessionConfig> {
        if let Some(days) = update.session_duration_days {
            validate_duration(days)?;
        }

        let mut config = self.session_config();
        let duration_changed = config.apply(&update);
        let now = self.clock.now();
        let live = if duration_changed {
            self.live_session(now)?
        } else {
            None
        };
        self.store.put(keys::SESSION_CONFIG, &config, None)?;

        if duration_changed {
            if let Some(mut record) = live {
                record.expires_at = now + config.duration();
                self.save_record(&record)?;
                self.expiry.schedule(record.expires_at, now);

                let _ = self.events.send(SessionEvent::Extended {
                    expires_at: record.expires_at,
                });
            }
        }

        debug!(?config, "Session config updated");
        Ok(config)
    }

    /// Remove local session state, then sign out remotely.
    ///
    /// Remote failures are logged; the local state is gone either way.
    pub async fn clear_session(&self) {
        self.clear_local();

        if let Err(e) = self.provider.sign_out().await {
            warn!(error = %e, "Remote sign-out failed");
        }
    }

    /// Remove local session state only
    pub fn clear_local(&self) {
        self.expiry.cancel();
        let had_session = matches!(self.store.local().get_raw(keys::SESSION), Ok(Some(_)));
        for key in keys::SESSION_KEYS {
            self.store.remove(key);
        }
        if had_session {
            info!("Session cleared");
            let _ = self.events.send(SessionEvent::Cleared);
        }
    }

    /// Refresh `last_activity` without moving the expiry
    pub fn touch_activity(&self) -> ClientResult<()> {
        let now = self.clock.now();
        let Some(mut record) = self.current_session() else {
            return Ok(());
        };
        if record.is_expired(now) {
            return Ok(());
        }

        record.last_activity = now;
        self.save_record(&record)?;
        debug!(user_id = %record.user_id, "Session activity recorded");
        Ok(())
    }

    /// The stored record, if readable
    pub fn current_session(&self) -> Option<SessionRecord> {
        self.store.get(keys::SESSION)
    }

    /// The stored record if it is still usable here; a dead one is rejected
    pub fn live_record(&self) -> Option<SessionRecord> {
        self.live_session(self.clock.now()).ok().flatten()
    }

    /// The stored config, or the default when absent
    pub fn session_config(&self) -> SessionConfig {
        self.store.get(keys::SESSION_CONFIG).unwrap_or_default()
    }

    /// Time left before the stored session expires
    pub fn time_remaining(&self) -> Option<Duration> {
        let record = self.current_session()?;
        let remaining = record.expires_at - self.clock.now();
        (remaining > Duration::zero()).then_some(remaining)
    }

    pub fn is_expiry_warning_scheduled(&self) -> bool {
        self.expiry.is_scheduled()
    }

    pub fn is_device_trusted(&self) -> bool {
        self.devices.is_trusted(&self.fingerprint)
    }

    /// Trust the current device
    pub fn add_trusted_device(&self, nickname: Option<String>) -> ClientResult<DeviceRecord> {
        self.devices.trust(
            &self.fingerprint,
            self.user_agent_signature.clone(),
            nickname,
            self.clock.now(),
        )
    }

    pub fn remove_trusted_device(&self, fingerprint: &DeviceFingerprint) -> ClientResult<bool> {
        self.devices.revoke(fingerprint)
    }

    pub fn trusted_devices(&self) -> Vec<DeviceRecord> {
        self.devices.list()
    }

    fn save_record(&self, record: &SessionRecord) -> ClientResult<()> {
        self.store.put(keys::SESSION, record, None)?;
        self.store
            .put(keys::LAST_ACTIVITY, &record.last_activity, None)
    }

    /// Why `record` may not be used at `now`, if it may not
    fn check_record(&self, record: &SessionRecord, now: DateTime<Utc>) -> Result<(), RejectionReason> {
        if record.is_expired(now) {
            return Err(RejectionReason::Expired);
        }
        if record.device_fingerprint != self.fingerprint && !self.is_device_trusted() {
            warn!(
                user_id = %record.user_id,
                stored = %record.device_fingerprint,
                current = %self.fingerprint,
                "Session belongs to another device"
            );
            return Err(RejectionReason::DeviceMismatch);
        }
        Ok(())
    }

    /// The stored record if it is still usable. A dead record is rejected
    /// and reported as an error; no record at all is `Ok(None)`.
    fn live_session(&self, now: DateTime<Utc>) -> ClientResult<Option<SessionRecord>> {
        let Some(record) = self.current_session() else {
            return Ok(None);
        };
        match self.check_record(&record, now) {
            Ok(()) => Ok(Some(record)),
            Err(reason) => {
                self.reject(reason);
                Err(ClientError::session(match reason {
                    RejectionReason::Expired => "Session has expired",
                    RejectionReason::DeviceMismatch => "Session belongs to another device",
                    RejectionReason::Corrupt => "Session record is unreadable",
                }))
            }
        }
    }

    fn reject(&self, reason: RejectionReason) {
        info!(?reason, "Stored session rejected");
        self.clear_local();
        let _ = self.events.send(SessionEvent::Rejected(reason));
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.expiry.cancel();
    }
}

fn validate_duration(days: i64) -> ClientResult<()> {
    if days < 1 {
        return Err(ClientError::validation(format!(
            "Session duration must be at least one day, got {}",
            days
        )));
    }
    Ok(())
}
