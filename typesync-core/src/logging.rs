//! Structured logging for the session and entitlement machinery
//!
//! Every component logs through `tracing` with stable field names
//! (`user_id`, `tier`, `transport`, `attempt`); this module installs the
//! subscriber and carries the operation macros shared by the binaries.

use serde::{Deserialize, Serialize};
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Base level (trace, debug, info, warn, error)
    pub level: String,
    pub format: LogFormat,
    /// Include file and line of each event
    pub include_location: bool,
    pub include_thread: bool,
    /// Append to `log_file_path` instead of stdout
    pub log_to_file: bool,
    pub log_file_path: Option<String>,
    /// Emit span close events with their timings
    pub enable_performance_monitoring: bool,
    /// Extra `EnvFilter` directives, e.g. `typesync_client::entitlement=trace`
    pub filter_directives: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
            include_location: false,
            include_thread: false,
            log_to_file: false,
            log_file_path: None,
            enable_performance_monitoring: false,
            filter_directives: Vec::new(),
        }
    }
}

impl LoggingConfig {
    /// Same configuration with debug output for every typesync crate
    pub fn verbose(mut self) -> Self {
        self.level = "debug".to_string();
        for target in ["typesync", "typesync_core", "typesync_client"] {
            let directive = format!("{}=debug", target);
            if !self.filter_directives.contains(&directive) {
                self.filter_directives.push(directive);
            }
        }
        self
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the configured level. Fails if a subscriber is
/// already installed or a directive does not parse.
pub fn init_logging(
    config: &LoggingConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    for directive in &config.filter_directives {
        filter = filter.add_directive(directive.parse()?);
    }

    let writer = match (config.log_to_file, &config.log_file_path) {
        (false, _) => BoxMakeWriter::new(io::stdout),
        (true, Some(path)) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            BoxMakeWriter::new(std::sync::Mutex::new(file))
        }
        (true, None) => {
            return Err("log_file_path must be specified when log_to_file is true".into())
        }
    };

    let span_events = if config.enable_performance_monitoring {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread)
        .with_thread_names(config.include_thread)
        .with_writer(writer);
    let fmt_layer = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Pretty => base.pretty().boxed(),
        LogFormat::Compact => base.compact().boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

/// Timing helpers
pub mod performance {
    use std::time::Instant;
    use tracing::{info_span, Instrument};

    /// Run `future` inside a `performance` span and log how long it took
    pub async fn measure_async<F, T>(operation_name: &str, future: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let started = Instant::now();
        let result = future
            .instrument(info_span!("performance", operation = operation_name))
            .await;
        tracing::debug!(
            target: "performance",
            operation = operation_name,
            duration_ms = started.elapsed().as_millis() as u64,
            "Operation timed"
        );
        result
    }
}

#[macro_export]
macro_rules! log_operation_start {
    ($operation:expr) => {
        tracing::info!(operation = $operation, "Starting operation")
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info!(operation = $operation, $($field)*, "Starting operation")
    };
}

#[macro_export]
macro_rules! log_operation_success {
    ($operation:expr) => {
        tracing::info!(operation = $operation, "Operation completed")
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::info!(operation = $operation, $($field)*, "Operation completed")
    };
}

#[macro_export]
macro_rules! log_operation_error {
    ($operation:expr, $error:expr) => {
        tracing::error!(operation = $operation, error = %$error, "Operation failed")
    };
    ($operation:expr, $error:expr, $($field:tt)*) => {
        tracing::error!(operation = $operation, error = %$error, $($field)*, "Operation failed")
    };
}
