//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the whole
//! protocol engine. Using the `thiserror` crate, it provides a centralized and
//! consistent way to report failures, from namespace lookups and template
//! parsing to instrument communication and worker crashes.
//!
//! ## Error Hierarchy
//!
//! - **`NotFound`**: a namespace lookup walked every ancestor up to `root`
//!   without finding the requested entry.
//! - **`InvalidPath`** / **`NameCollision`**: malformed namespace paths, or a
//!   value name clashing with a sub-node name inside one node.
//! - **`Build`**: a preference map could not be turned back into a task tree
//!   (unknown `task_id`, missing field, inconsistent execution contracts).
//! - **`InstrumentIo`**: the single error kind raised by instrument drivers.
//!   The crash-isolation contract turns it into a controlled stop.
//! - **`WorkerCrash`**: any other failure inside the worker. It aborts the run
//!   with a `FAILED` status.
//! - **`EngineBusy`**: a run was started while another one was in progress.
//! - **`Evaluation`**: a formula or format string could not be evaluated.
//! - **`Config`** / **`Configuration`**: loading or validating the engine
//!   configuration failed.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error
//! types, so the `?` operator works across the crate.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Entry '{name}' not found from '{path}' up to the root")]
    NotFound { path: String, name: String },

    #[error("Invalid namespace path: {0}")]
    InvalidPath(String),

    #[error("Name '{name}' is already used by a node or a value in '{path}'")]
    NameCollision { path: String, name: String },

    #[error("Failed to build task tree: {0}")]
    Build(String),

    #[error("Instrument I/O error: {0}")]
    InstrumentIo(String),

    #[error("Worker crashed: {0}")]
    WorkerCrash(String),

    #[error("Execution engine is busy: {0}")]
    EngineBusy(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Template error: {0}")]
    Template(String),
}

impl DaqError {
    /// Shorthand for a [`DaqError::NotFound`] error.
    pub fn not_found(path: &str, name: &str) -> Self {
        DaqError::NotFound {
            path: path.to_string(),
            name: name.to_string(),
        }
    }

    /// True for the error kind the crash-isolation contract absorbs.
    pub fn is_instrument_io(&self) -> bool {
        matches!(self, DaqError::InstrumentIo(_))
    }
}

impl From<toml::de::Error> for DaqError {
    fn from(err: toml::de::Error) -> Self {
        DaqError::Template(err.to_string())
    }
}

impl From<toml::ser::Error> for DaqError {
    fn from(err: toml::ser::Error) -> Self {
        DaqError::Template(err.to_string())
    }
}
