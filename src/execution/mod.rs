//! Running a protocol away from the controller.
//!
//! - [`protocol`]: the messages exchanged with a worker
//! - [`worker`]: the worker loop, hosted in a child process or a thread
//! - [`engine`]: the controller side, its state machine and its channels

pub mod engine;
pub mod protocol;
pub mod worker;

pub use engine::{ExecutionEngine, RunController, RunHandle, RunOutcome};
pub use protocol::{ControlCommand, EngineState, LogRecord, RuntimeContext, WorkerMessage};
pub use worker::{
    run_worker, serve_stdio, StdoutLink, WorkerLink, WorkerRegistries, FORCE_STOP_EXIT_CODE,
};
