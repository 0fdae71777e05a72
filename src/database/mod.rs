//! Hierarchical namespace shared by the tasks of a protocol.
//!
//! - [`path`]: path syntax and validation
//! - [`store`]: the [`TaskDatabase`] itself and its change events

pub mod path;
pub mod store;

pub use store::{DatabaseEvent, DatabaseListener, TaskDatabase};
