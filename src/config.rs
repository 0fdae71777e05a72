//! Engine configuration using Figment
//!
//! Configuration is loaded from:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `DAQ_PROTOCOL_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! DAQ_PROTOCOL_WORKER__MODE=thread
//! DAQ_PROTOCOL_WORKER__STOP_GRACE_MS=2000
//! DAQ_PROTOCOL_LOGGING__LEVEL=debug
//! ```
//!
//! # Example file
//!
//! ```toml
//! [worker]
//! mode = "process"
//! stop_grace_ms = 5000
//!
//! [logging]
//! level = "info"
//!
//! [profiles.source]
//! driver = "SimulatedSource"
//! settings = { voltage = 1.0 }
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::instrument::{DriverRegistry, InstrumentProfile};

/// Prefix of the environment overrides.
pub const ENV_PREFIX: &str = "DAQ_PROTOCOL_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How runs are hosted
    #[serde(default)]
    pub worker: WorkerConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Run options
    #[serde(default)]
    pub run: RunConfig,
    /// Instrument profiles by name
    #[serde(default)]
    pub profiles: BTreeMap<String, InstrumentProfile>,
}

/// Where the worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    /// Child process talking over stdio
    #[default]
    Process,
    /// Thread of the controller
    Thread,
}

/// Worker hosting configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Process or thread
    #[serde(default)]
    pub mode: WorkerMode,
    /// Executable providing the `worker` subcommand (defaults to the
    /// current executable)
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Time given to a stopped worker before it is killed
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
    /// Time allowed to drain the news and log channels at exit
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive (trace, debug, info, warn, error, or an `EnvFilter`
    /// expression)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human readable text
    #[serde(default)]
    pub json: bool,
}

/// Run options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Run without checking the tree first
    #[serde(default)]
    pub skip_check: bool,
    /// Open instrument connections while checking
    #[serde(default)]
    pub test_instruments: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_stop_grace() -> u64 {
    5000
}

fn default_drain_timeout() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            mode: WorkerMode::default(),
            program: None,
            stop_grace_ms: default_stop_grace(),
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl WorkerConfig {
    /// Grace period between a stop and a kill.
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Bound on channel draining.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl EngineConfig {
    /// Load defaults, the optional `path`, then the environment.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(DaqError::Configuration(format!(
                    "configuration file '{}' does not exist",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string, without environment overrides.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::string(text))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values that cannot be expressed by types.
    pub fn validate(&self) -> AppResult<()> {
        if self.worker.stop_grace_ms == 0 {
            return Err(DaqError::Configuration(
                "worker.stop_grace_ms must be greater than zero".to_string(),
            ));
        }
        if self.worker.drain_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "worker.drain_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.logging.level.trim().is_empty() {
            return Err(DaqError::Configuration(
                "logging.level must not be empty".to_string(),
            ));
        }
        for (name, profile) in &self.profiles {
            if profile.driver.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "profile '{}' does not name a driver",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Check that every profile uses a driver known to `registry`.
    pub fn validate_drivers(&self, registry: &DriverRegistry) -> AppResult<()> {
        for (name, profile) in &self.profiles {
            if !registry.contains(&profile.driver) {
                return Err(DaqError::Configuration(format!(
                    "profile '{}' uses unknown driver '{}' (known: {})",
                    name,
                    profile.driver,
                    registry.driver_types().join(", ")
                )));
            }
        }
        Ok(())
    }
}
