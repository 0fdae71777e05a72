//! Core library for the daq_protocol application.
//!
//! A measurement protocol is a tree of tasks (sleep, print, loops, formulas,
//! instrument reads and writes) sharing a hierarchical namespace. This
//! library builds such trees from saved templates, checks them, and runs
//! them in an isolated worker while relaying progress to the controller.
//!
//! ## Modules
//!
//! - [`database`]: the namespace shared by the tasks of a run.
//! - [`tasks`]: the task tree, its lifecycle and the built-in task types.
//! - [`contracts`]: stop, parallel, wait and crash-isolation wrappers applied
//!   around every task body.
//! - [`instrument`]: the driver contract, registry and connection pool.
//! - [`execution`]: the worker loop and the engine supervising it.
//! - [`monitor`]: rule-driven text view over namespace values.
//! - [`config`], [`logging`], [`error`]: ambient plumbing.

pub mod config;
pub mod contracts;
pub mod database;
pub mod error;
pub mod eval;
pub mod execution;
pub mod instrument;
pub mod logging;
pub mod monitor;
pub mod preferences;
pub mod tasks;

pub use error::{AppResult, DaqError};
