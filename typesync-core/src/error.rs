//! Unified error handling system
//!
//! Provides structured error types with context, recovery suggestions, and proper error chaining

use crate::types::ProviderErrorCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};

pub type TypesyncResult<T> = Result<T, TypesyncError>;

/// Message fragments that mark a remote failure as permission-class
const PERMISSION_MARKERS: [&str; 3] = ["permission", "insufficient", "unauthorized"];

/// Error context providing additional information for debugging and recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Unique error ID for tracking
    pub error_id: String,
    /// Timestamp when error occurred
    pub timestamp: DateTime<Utc>,
    /// Component where error originated
    pub component: String,
    /// Operation being performed when error occurred
    pub operation: Option<String>,
    /// Additional metadata
    pub metadata: std::collections::HashMap<String, String>,
    /// Recovery suggestions
    pub recovery_suggestions: Vec<String>,
}

impl ErrorContext {
    pub fn new(component: &str) -> Self {
        Self {
            error_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            component: component.to_string(),
            operation: None,
            metadata: std::collections::HashMap::new(),
            recovery_suggestions: Vec::new(),
        }
    }

    pub fn with_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_suggestion(mut self, suggestion: &str) -> Self {
        self.recovery_suggestions.push(suggestion.to_string());
        self
    }
}

/// Main error type for the Typesync system
#[derive(Error, Debug)]
pub enum TypesyncError {
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },

    /// Failure reported by the identity provider
    #[error("Identity provider error ({code}): {message}")]
    Provider {
        code: ProviderErrorCode,
        message: String,
        context: ErrorContext,
    },

    #[error("Permission denied: {message}")]
    PermissionDenied {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
        context: ErrorContext,
    },

    #[error("Resource not found: {resource}")]
    NotFound {
        resource: String,
        context: ErrorContext,
    },

    #[error("Operation timeout: {operation}")]
    Timeout {
        operation: String,
        duration_ms: u64,
        context: ErrorContext,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        context: ErrorContext,
    },
}

impl TypesyncError {
    /// Build a provider error for the given code
    pub fn provider(code: ProviderErrorCode, message: impl Into<String>, component: &str) -> Self {
        TypesyncError::Provider {
            code,
            message: message.into(),
            context: ErrorContext::new(component),
        }
    }

    /// Get the error context
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            TypesyncError::Storage { context, .. } => Some(context),
            TypesyncError::Config { context, .. } => Some(context),
            TypesyncError::Network { context, .. } => Some(context),
            TypesyncError::Provider { context, .. } => Some(context),
            TypesyncError::PermissionDenied { context, .. } => Some(context),
            TypesyncError::Validation { context, .. } => Some(context),
            TypesyncError::NotFound { context, .. } => Some(context),
            TypesyncError::Timeout { context, .. } => Some(context),
            TypesyncError::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Provider error code, if this error came from the identity provider
    pub fn provider_code(&self) -> Option<ProviderErrorCode> {
        match self {
            TypesyncError::Provider { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether this is an authorization/permission failure that a credential
    /// resync may cure.
    pub fn is_permission_error(&self) -> bool {
        match self {
            TypesyncError::PermissionDenied { .. } => true,
            TypesyncError::Provider { code, .. } if code.is_permission_class() => true,
            other => message_indicates_permission(&other.to_string()),
        }
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            TypesyncError::Network { .. } => true,
            TypesyncError::Timeout { .. } => true,
            TypesyncError::PermissionDenied { .. } => true,
            TypesyncError::Provider { code, .. } => code.is_permission_class(),
            TypesyncError::Config { .. } => false,
            TypesyncError::Validation { .. } => false,
            TypesyncError::NotFound { .. } => false,
            _ => false,
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            TypesyncError::Internal { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Internal error occurred"
                );
            }
            TypesyncError::Config { .. } | TypesyncError::Validation { .. } => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Configuration or validation error"
                );
            }
            TypesyncError::Network { .. }
            | TypesyncError::Timeout { .. }
            | TypesyncError::PermissionDenied { .. } => {
                warn!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Transient remote error (may be recoverable)"
                );
            }
            _ => {
                error!(
                    error_id = ?self.context().map(|c| &c.error_id),
                    error = %self,
                    "Error occurred"
                );
            }
        }
    }
}

/// Case-insensitive check for the permission markers in an error message
pub fn message_indicates_permission(message: &str) -> bool {
    let lowered = message.to_lowercase();
    PERMISSION_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Convenience macros for creating errors with context
#[macro_export]
macro_rules! storage_error {
    ($msg:expr, $component:expr) => {
        $crate::TypesyncError::Storage {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component),
        }
    };
    ($msg:expr, $component:expr, $source:expr) => {
        $crate::TypesyncError::Storage {
            message: $msg.to_string(),
            source: Some(Box::new($source)),
            context: $crate::ErrorContext::new($component),
        }
    };
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr, $component:expr) => {
        $crate::TypesyncError::Config {
            message: $msg.to_string(),
            source: None,
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check your configuration file")
                .with_suggestion("Run 'typesync config --init' to create default config"),
        }
    };
}

#[macro_export]
macro_rules! validation_error {
    ($msg:expr, $field:expr, $component:expr) => {
        $crate::TypesyncError::Validation {
            message: $msg.to_string(),
            field: Some($field.to_string()),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Check the field value and format"),
        }
    };
}

#[macro_export]
macro_rules! not_found_error {
    ($resource:expr, $component:expr) => {
        $crate::TypesyncError::NotFound {
            resource: $resource.to_string(),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Verify the document collection and id"),
        }
    };
}

#[macro_export]
macro_rules! permission_error {
    ($msg:expr, $component:expr) => {
        $crate::TypesyncError::PermissionDenied {
            message: $msg.to_string(),
            context: $crate::ErrorContext::new($component)
                .with_suggestion("Refresh the credential and retry"),
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_classification() {
        assert!(permission_error!("denied", "test").is_permission_error());
        assert!(
            TypesyncError::provider(ProviderErrorCode::Unauthenticated, "expired", "test")
                .is_permission_error()
        );
        assert!(!TypesyncError::provider(
            ProviderErrorCode::WrongPassword,
            "bad password",
            "test"
        )
        .is_permission_error());

        // Message-based fallback for errors surfaced as generic failures
        let internal = TypesyncError::Internal {
            message: "Missing or insufficient permissions.".to_string(),
            source: None,
            context: ErrorContext::new("test"),
        };
        assert!(internal.is_permission_error());

        let network = TypesyncError::Network {
            message: "connection reset".to_string(),
            source: None,
            context: ErrorContext::new("test"),
        };
        assert!(!network.is_permission_error());
    }

    #[test]
    fn test_message_markers_are_case_insensitive() {
        assert!(message_indicates_permission("UNAUTHORIZED request"));
        assert!(message_indicates_permission("Permission denied on users/abc"));
        assert!(!message_indicates_permission("quota exceeded"));
    }
}
