//! Logical names of persisted keys

pub const SESSION: &str = "typesync.session";
pub const SESSION_CONFIG: &str = "typesync.session_config";
pub const TRUSTED_DEVICES: &str = "typesync.trusted_devices";
pub const LAST_ACTIVITY: &str = "typesync.last_activity";
pub const PENDING_UPGRADES: &str = "typesync.pending_upgrades";
pub const PENDING_ACTIONS: &str = "typesync.pending_actions";

/// Written by a tab after a sign-in or sign-out so the others resync credentials
pub const AUTH_SYNC_SIGNAL: &str = "typesync.auth_sync";
/// Carries `{tier, timestamp, userId}` after an entitlement change
pub const ENTITLEMENT_SIGNAL: &str = "typesync.entitlement_update";

/// Keys owned by the session lifecycle; removed together on sign-out
pub const SESSION_KEYS: [&str; 3] = [SESSION, SESSION_CONFIG, LAST_ACTIVITY];
