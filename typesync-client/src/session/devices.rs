//! Trusted device registry
//!
//! Persisted independently of any session so trust survives sign-out.

use super::types::DeviceRecord;
use crate::fingerprint::DeviceFingerprint;
use crate::store::{keys, SecureStore};
use crate::ClientResult;
use chrono::{DateTime, Utc};
use tracing::info;

#[derive(Clone)]
pub struct TrustedDevices {
    store: SecureStore,
}

impl TrustedDevices {
    pub fn new(store: SecureStore) -> Self {
        Self { store }
    }

    /// Every known device, oldest first
    pub fn list(&self) -> Vec<DeviceRecord> {
        let mut devices = self.load();
        devices.sort_by_key(|device| device.first_seen);
        devices
    }

    pub fn is_trusted(&self, fingerprint: &DeviceFingerprint) -> bool {
        self.load()
            .iter()
            .any(|device| &device.fingerprint == fingerprint && device.trusted)
    }

    /// Insert or refresh a trusted device
    pub fn trust(
        &self,
        fingerprint: &DeviceFingerprint,
        user_agent_signature: String,
        nickname: Option<String>,
        now: DateTime<Utc>,
    ) -> ClientResult<DeviceRecord> {
        let mut devices = self.load();

        let record = match devices.iter_mut().find(|d| &d.fingerprint == fingerprint) {
            Some(existing) => {
                existing.trusted = true;
                existing.last_used = now;
                existing.user_agent_signature = user_agent_signature;
                if nickname.is_some() {
                    existing.nickname = nickname;
                }
                existing.clone()
            }
            None => {
                let record = DeviceRecord {
                    fingerprint: fingerprint.clone(),
                    user_agent_signature,
                    trusted: true,
                    first_seen: now,
                    last_used: now,
                    nickname,
                };
                devices.push(record.clone());
                record
            }
        };

        self.store.put(keys::TRUSTED_DEVICES, &devices, None)?;
        info!(fingerprint = %fingerprint, "Device trusted");
        Ok(record)
    }

    /// Forget a device; returns whether it was known
    pub fn revoke(&self, fingerprint: &DeviceFingerprint) -> ClientResult<bool> {
        let mut devices = self.load();
        let before = devices.len();
        devices.retain(|device| &device.fingerprint != fingerprint);
        if devices.len() == before {
            return Ok(false);
        }

        self.store.put(keys::TRUSTED_DEVICES, &devices, None)?;
        info!(fingerprint = %fingerprint, "Device trust revoked");
        Ok(true)
    }

    fn load(&self) -> Vec<DeviceRecord> {
        self.store
            .get::<Vec<DeviceRecord>>(keys::TRUSTED_DEVICES)
            .unwrap_or_default()
    }
}
