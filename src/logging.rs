//! Tracing setup for the controller and the worker.
//!
//! The worker always writes JSON lines to stderr so the controller can parse
//! them back into [`LogRecord`]s and [`replay`] them into its own subscriber,
//! tagged `origin=worker`.

use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{AppResult, DaqError};
use crate::execution::LogRecord;

fn filter(level: &str) -> AppResult<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| DaqError::Configuration(format!("invalid log level '{}': {}", level, e)))
}

/// Install the controller subscriber.
pub fn init_tracing(config: &LoggingConfig) -> AppResult<()> {
    let filter = filter(&config.level)?;
    let result = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };
    result.map_err(|e| DaqError::Configuration(format!("could not install logger: {}", e)))
}

/// Install the worker subscriber: JSON lines on stderr.
pub fn init_worker_tracing(level: &str) -> AppResult<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter(level)?)
        .with_writer(std::io::stderr)
        .with_current_span(false)
        .with_span_list(false)
        .with_ansi(false)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("could not install logger: {}", e)))
}

/// Re-emit a worker record through the controller subscriber.
pub fn replay(record: &LogRecord) {
    let source = record.target.as_deref().unwrap_or("");
    let message = record.message();
    let fields = record.extra_fields();
    match record.level.to_ascii_uppercase().as_str() {
        "ERROR" => error!(origin = "worker", source, fields = %fields, "{}", message),
        "WARN" => warn!(origin = "worker", source, fields = %fields, "{}", message),
        "INFO" => info!(origin = "worker", source, fields = %fields, "{}", message),
        "DEBUG" => debug!(origin = "worker", source, fields = %fields, "{}", message),
        _ => trace!(origin = "worker", source, fields = %fields, "{}", message),
    }
}
