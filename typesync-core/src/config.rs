//! Configuration management

use crate::error::{TypesyncError, TypesyncResult};
use crate::logging::LoggingConfig;
use crate::types::{
    EntitlementSettings, QueueSettings, RetrySettings, SessionSettings, StorageSettings,
    SubscriptionTier, TypesyncConfig,
};

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

impl Default for TypesyncConfig {
    fn default() -> Self {
        Self {
            session: SessionSettings::default(),
            entitlement: EntitlementSettings::default(),
            retry: RetrySettings::default(),
            queue: QueueSettings::default(),
            storage: StorageSettings {
                data_dir: "~/.typesync".to_string(),
            },
            redeem_codes: HashMap::from([
                ("TYPESYNC-PREMIUM".to_string(), SubscriptionTier::Premium),
                ("TYPESYNC-PRO".to_string(), SubscriptionTier::Pro),
            ]),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_duration_days: 7,
            trusted_duration_days: 30,
            expiry_warning_minutes: 30,
            activity_throttle_secs: 60,
        }
    }
}

impl Default for EntitlementSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 45,
            reconcile_interval_secs: 30,
            channel_name: "typesync-entitlement".to_string(),
        }
    }
}

impl EntitlementSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay_ms: 1000,
        }
    }
}

impl RetrySettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            upgrade_retry_ttl_hours: 24,
            post_auth_action_ttl_minutes: 10,
        }
    }
}

impl TypesyncConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> TypesyncResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| TypesyncError::Config {
            message: format!("Failed to read config file: {}", e),
            source: Some(Box::new(e)),
            context: crate::ErrorContext::new("config")
                .with_operation("read_file")
                .with_suggestion("Check if the config file exists and is readable"),
        })?;

        let config: TypesyncConfig = toml::from_str(&content).map_err(|e| TypesyncError::Config {
            message: format!("Failed to parse config: {}", e),
            source: Some(Box::new(e)),
            context: crate::ErrorContext::new("config")
                .with_operation("parse_toml")
                .with_suggestion("Check TOML syntax in config file"),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> TypesyncResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| TypesyncError::Config {
            message: format!("Failed to serialize config: {}", e),
            source: Some(Box::new(e)),
            context: crate::ErrorContext::new("config").with_operation("serialize_toml"),
        })?;

        std::fs::write(path, content).map_err(|e| TypesyncError::Config {
            message: format!("Failed to write config file: {}", e),
            source: Some(Box::new(e)),
            context: crate::ErrorContext::new("config")
                .with_operation("write_file")
                .with_suggestion("Check if the directory exists and is writable"),
        })?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> TypesyncResult<()> {
        let positive_checks: [(&str, i64); 6] = [
            (
                "session.default_duration_days",
                self.session.default_duration_days,
            ),
            (
                "session.trusted_duration_days",
                self.session.trusted_duration_days,
            ),
            (
                "session.expiry_warning_minutes",
                self.session.expiry_warning_minutes,
            ),
            (
                "entitlement.poll_interval_secs",
                self.entitlement.poll_interval_secs as i64,
            ),
            (
                "entitlement.reconcile_interval_secs",
                self.entitlement.reconcile_interval_secs as i64,
            ),
            (
                "queue.upgrade_retry_ttl_hours",
                self.queue.upgrade_retry_ttl_hours,
            ),
        ];

        for (field, value) in positive_checks {
            if value <= 0 {
                return Err(TypesyncError::Config {
                    message: format!("{} must be greater than 0", field),
                    source: None,
                    context: crate::ErrorContext::new("config")
                        .with_operation("validate")
                        .with_metadata("field", field)
                        .with_suggestion(&format!("Set {} to a positive value", field)),
                });
            }
        }

        if self.entitlement.channel_name.trim().is_empty() {
            return Err(TypesyncError::Config {
                message: "entitlement.channel_name must not be empty".to_string(),
                source: None,
                context: crate::ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set entitlement.channel_name to a non-empty name"),
            });
        }

        if self.queue.post_auth_action_ttl_minutes <= 0 {
            return Err(TypesyncError::Config {
                message: "queue.post_auth_action_ttl_minutes must be greater than 0".to_string(),
                source: None,
                context: crate::ErrorContext::new("config")
                    .with_operation("validate")
                    .with_suggestion("Set queue.post_auth_action_ttl_minutes to a positive value"),
            });
        }

        Ok(())
    }

    /// Look up a redeem code, ignoring surrounding whitespace and case
    pub fn redeem_tier(&self, code: &str) -> Option<SubscriptionTier> {
        let normalized = code.trim().to_uppercase();
        self.redeem_codes.get(&normalized).copied()
    }
}
