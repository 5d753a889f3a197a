//! Obfuscating, timestamped wrapper over a [`LocalStore`]
//!
//! Values are serialized to JSON, XOR-ed with a fixed key and base64 encoded
//! inside an envelope carrying the write time and an optional expiry. This
//! keeps casual inspection of the profile from revealing session data; it is
//! not encryption.
//!
//! Reads fail closed: a missing, expired, undecodable or mistyped value is
//! reported as absent, never as an error.

use super::shared::LocalStore;
use crate::{ClientError, ClientResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use typesync_core::SharedClock;
use tracing::{debug, warn};

const OBFUSCATION_KEY: &[u8] = b"typesync::local-store::v1";
const ENVELOPE_VERSION: u8 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StorageEnvelope {
    v: u8,
    written_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    payload: String,
}

/// A decoded value with its write timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub written_at: DateTime<Utc>,
}

fn xor(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .zip(OBFUSCATION_KEY.iter().cycle())
        .map(|(b, k)| b ^ k)
        .collect()
}

/// Obfuscating store
#[derive(Clone)]
pub struct SecureStore {
    store: LocalStore,
    clock: SharedClock,
}

impl SecureStore {
    pub fn new(store: LocalStore, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    pub fn local(&self) -> &LocalStore {
        &self.store
    }

    /// Write `value` under `key`, optionally expiring after `ttl`
    pub fn put<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> ClientResult<()> {
        let now = self.clock.now();
        let json = serde_json::to_vec(value).map_err(ClientError::Serialization)?;
        let envelope = StorageEnvelope {
            v: ENVELOPE_VERSION,
            written_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
            payload: STANDARD.encode(xor(&json)),
        };
        let raw = serde_json::to_string(&envelope).map_err(ClientError::Serialization)?;
        self.store.set_raw(key, &raw)
    }

    /// Read the value under `key`
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_stored(key).map(|stored| stored.value)
    }

    /// Read the value under `key` together with its write timestamp
    pub fn get_stored<T: DeserializeOwned>(&self, key: &str) -> Option<Stored<T>> {
        let raw = match self.store.get_raw(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read from local store");
                return None;
            }
        };

        match self.decode(&raw) {
            Ok(Some(stored)) => Some(stored),
            Ok(None) => {
                debug!(key, "Stored value expired, removing");
                self.remove(key);
                None
            }
            Err(reason) => {
                warn!(key, reason = %reason, "Discarding unreadable stored value");
                self.remove(key);
                None
            }
        }
    }

    /// Remove `key`; failures are logged
    pub fn remove(&self, key: &str) {
        if let Err(e) = self.store.remove_raw(key) {
            warn!(key, error = %e, "Failed to remove key from local store");
        }
    }

    fn decode<T: DeserializeOwned>(&self, raw: &str) -> Result<Option<Stored<T>>, String> {
        let envelope: StorageEnvelope =
            serde_json::from_str(raw).map_err(|e| format!("bad envelope: {}", e))?;
        if envelope.v != ENVELOPE_VERSION {
            return Err(format!("unsupported envelope version {}", envelope.v));
        }
        if let Some(expires_at) = envelope.expires_at {
            if self.clock.now() > expires_at {
                return Ok(None);
            }
        }

        let bytes = STANDARD
            .decode(envelope.payload.as_bytes())
            .map_err(|e| format!("bad payload encoding: {}", e))?;
        let value = serde_json::from_slice(&xor(&bytes))
            .map_err(|e| format!("bad payload: {}", e))?;

        Ok(Some(Stored {
            value,
            written_at: envelope.written_at,
        }))
    }
}
