//! Worker side of a run.
//!
//! [`run_worker`] builds the tree from its preferences, checks it, runs it
//! and reports every state transition and namespace change through a
//! [`WorkerLink`]. It does not know whether it lives in a child process
//! ([`serve_stdio`]) or on a thread of the controller.

use parking_lot::Mutex;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::protocol::{ControlCommand, EngineState, RuntimeContext, WorkerMessage};
use crate::contracts::panic_message;
use crate::database::{DatabaseEvent, TaskDatabase};
use crate::error::{AppResult, DaqError};
use crate::instrument::{DriverRegistry, InstrumentPool};
use crate::preferences::Preferences;
use crate::tasks::{RootContext, TaskRegistry};

/// Exit code of a worker killed by `FORCE_STOP`.
pub const FORCE_STOP_EXIT_CODE: i32 = 130;

/// Outbound half of the worker channel.
pub trait WorkerLink: Send + Sync {
    /// Deliver one message to the controller.
    fn send(&self, message: WorkerMessage);
}

/// Registries used to rebuild the tree inside the worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerRegistries {
    /// Task types.
    pub tasks: Arc<TaskRegistry>,
    /// Driver types.
    pub drivers: Arc<DriverRegistry>,
}

/// Build, check and run a protocol, returning its terminal state.
pub fn run_worker(
    context: RuntimeContext,
    preferences: Preferences,
    registries: &WorkerRegistries,
    link: Arc<dyn WorkerLink>,
    control: Receiver<ControlCommand>,
) -> EngineState {
    link.send(WorkerMessage::status(EngineState::Preparing));
    info!(run_id = %context.run_id, "Preparing run");

    let database = Arc::new(TaskDatabase::new());
    let instruments = Arc::new(InstrumentPool::new(
        registries.drivers.clone(),
        context.profiles.clone(),
    ));
    let root_context = Arc::new(RootContext::new(database.clone(), instruments));

    let root = match registries.tasks.build_root(&preferences, root_context.clone()) {
        Ok(root) => root,
        Err(e) => {
            error!(error = %e, "Could not build the task tree");
            link.send(WorkerMessage::failed(e.to_string()));
            return EngineState::Failed;
        }
    };

    if !context.skip_check {
        let report = root.check(&context.check);
        if !report.is_ok() {
            for (task, messages) in report.failures() {
                for message in messages {
                    error!(task = %task, "{}", message);
                }
            }
            link.send(WorkerMessage::failed(format!("check failed:\n{}", report)));
            return EngineState::Failed;
        }
    }

    let news_link = link.clone();
    let news_context = context.clone();
    database.observe(move |event| match event {
        DatabaseEvent::Added { path, value } | DatabaseEvent::Updated { path, value } => {
            if news_context.observes(path) {
                news_link.send(WorkerMessage::News {
                    path: path.clone(),
                    value: value.clone(),
                });
            }
        }
        DatabaseEvent::Removed { .. } | DatabaseEvent::Renamed { .. } => {}
    });

    let forced = Arc::new(AtomicBool::new(false));
    spawn_control_listener(control, root_context.clone(), forced.clone());

    link.send(WorkerMessage::status(EngineState::Running));
    info!(run_id = %context.run_id, "Run started");

    let result = panic::catch_unwind(AssertUnwindSafe(|| root.perform()))
        .unwrap_or_else(|payload| {
            Err(DaqError::WorkerCrash(panic_message(payload.as_ref())))
        });
    let failures = root_context.control.failures.snapshot();

    let (state, message) = if forced.load(Ordering::SeqCst) {
        (EngineState::Interrupted, None)
    } else {
        match result {
            Err(e) => {
                error!(error = %e, "Run failed");
                (EngineState::Failed, Some(e.to_string()))
            }
            Ok(()) if root_context.stop_flag().is_set() => (EngineState::Interrupted, None),
            Ok(()) => (EngineState::Completed, None),
        }
    };
    info!(run_id = %context.run_id, state = %state, "Run finished");

    link.send(WorkerMessage::Status {
        state,
        message,
        failures,
        timestamp: chrono::Utc::now(),
    });
    state
}

fn spawn_control_listener(
    control: Receiver<ControlCommand>,
    context: Arc<RootContext>,
    forced: Arc<AtomicBool>,
) {
    let spawned = std::thread::Builder::new()
        .name("worker-control".to_string())
        .spawn(move || {
            for command in control.iter() {
                match command {
                    ControlCommand::Stop => {
                        info!("Stop requested");
                        context.stop_flag().set();
                    }
                    ControlCommand::ForceStop => {
                        warn!("Force stop requested");
                        forced.store(true, Ordering::SeqCst);
                        context.stop_flag().set();
                    }
                }
            }
        });
    if let Err(e) = spawned {
        error!(error = %e, "Could not start the control listener");
    }
}

// =============================================================================
// Process mode
// =============================================================================

/// [`WorkerLink`] writing JSON lines to stdout.
pub struct StdoutLink {
    out: Mutex<std::io::Stdout>,
}

impl Default for StdoutLink {
    fn default() -> Self {
        Self {
            out: Mutex::new(std::io::stdout()),
        }
    }
}

impl WorkerLink for StdoutLink {
    fn send(&self, message: WorkerMessage) {
        let line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Could not serialize worker message");
                return;
            }
        };
        let mut out = self.out.lock();
        if writeln!(out, "{}", line).and_then(|_| out.flush()).is_err() {
            warn!("Controller is gone, dropping worker message");
        }
    }
}

/// Serve one run over stdin / stdout.
///
/// Reads the runtime context and the tree from the first two stdin lines,
/// then forwards `STOP` lines to the run. `FORCE_STOP` exits the process
/// at once.
pub fn serve_stdio(registries: &WorkerRegistries) -> AppResult<EngineState> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    let mut next_line = |what: &str| -> AppResult<String> {
        lines
            .next()
            .transpose()?
            .ok_or_else(|| DaqError::WorkerCrash(format!("stdin closed before the {}", what)))
    };
    let context: RuntimeContext = serde_json::from_str(&next_line("runtime context")?)?;
    let preferences: Preferences = serde_json::from_str(&next_line("task tree")?)?;
    drop(next_line);
    drop(lines);

    let (control_tx, control_rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("worker-stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match ControlCommand::parse(&line) {
                    Some(ControlCommand::ForceStop) => {
                        warn!("Force stop requested, exiting");
                        std::process::exit(FORCE_STOP_EXIT_CODE);
                    }
                    Some(command) => {
                        if control_tx.send(command).is_err() {
                            break;
                        }
                    }
                    None => warn!(line = %line, "Ignoring unknown control line"),
                }
            }
        })?;

    let link: Arc<dyn WorkerLink> = Arc::new(StdoutLink::default());
    Ok(run_worker(context, preferences, registries, link, control_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Collect {
        messages: Mutex<Vec<WorkerMessage>>,
    }

    impl WorkerLink for Collect {
        fn send(&self, message: WorkerMessage) {
            self.messages.lock().push(message);
        }
    }

    impl Collect {
        fn states(&self) -> Vec<EngineState> {
            self.messages
                .lock()
                .iter()
                .filter_map(|m| match m {
                    WorkerMessage::Status { state, .. } => Some(*state),
                    WorkerMessage::News { .. } => None,
                })
                .collect()
        }
    }

    fn tree(children: Vec<Preferences>) -> Preferences {
        let mut prefs = Preferences::new().with("task_id", "Root").with("name", "root");
        prefs.set_children(children);
        prefs
    }

    fn print(name: &str, message: &str) -> Preferences {
        Preferences::new()
            .with("task_id", "Print")
            .with("name", name)
            .with("message", message)
    }

    #[test]
    fn test_completed_run_reports_news() {
        let link = Arc::new(Collect::default());
        let (_tx, rx) = mpsc::channel();
        let state = run_worker(
            RuntimeContext::new(),
            tree(vec![print("print", "x")]),
            &WorkerRegistries::default(),
            link.clone(),
            rx,
        );
        assert_eq!(state, EngineState::Completed);
        assert_eq!(
            link.states(),
            vec![
                EngineState::Preparing,
                EngineState::Running,
                EngineState::Completed
            ]
        );
        assert!(link.messages.lock().contains(&WorkerMessage::News {
            path: "root/print_message".into(),
            value: json!("x"),
        }));
    }

    #[test]
    fn test_failed_check_fails_run() {
        let link = Arc::new(Collect::default());
        let (_tx, rx) = mpsc::channel();
        let state = run_worker(
            RuntimeContext::new(),
            tree(vec![print("print", "{unknown}")]),
            &WorkerRegistries::default(),
            link.clone(),
            rx,
        );
        assert_eq!(state, EngineState::Failed);
        assert_eq!(link.states(), vec![EngineState::Preparing, EngineState::Failed]);
    }

    #[test]
    fn test_unknown_task_fails_build() {
        let link = Arc::new(Collect::default());
        let (_tx, rx) = mpsc::channel();
        let bad = Preferences::new().with("task_id", "Nope").with("name", "n");
        let state = run_worker(
            RuntimeContext::new(),
            tree(vec![bad]),
            &WorkerRegistries::default(),
            link,
            rx,
        );
        assert_eq!(state, EngineState::Failed);
    }

    #[test]
    fn test_stop_interrupts_run() {
        let link = Arc::new(Collect::default());
        let (tx, rx) = mpsc::channel();
        let sleep = Preferences::new()
            .with("task_id", "Sleep")
            .with("name", "long")
            .with("time", "30");
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            tx.send(ControlCommand::Stop).unwrap();
        });
        let start = std::time::Instant::now();
        let state = run_worker(
            RuntimeContext::new(),
            tree(vec![sleep, print("after", "never")]),
            &WorkerRegistries::default(),
            link.clone(),
            rx,
        );
        stopper.join().unwrap();
        assert_eq!(state, EngineState::Interrupted);
        assert!(start.elapsed() < std::time::Duration::from_secs(10));
        assert!(!link.messages.lock().iter().any(|m| matches!(
            m,
            WorkerMessage::News { path, value } if path == "root/after_message" && value == &json!("never")
        )));
    }

    #[test]
    fn test_instrument_crash_interrupts_run() {
        let link = Arc::new(Collect::default());
        let (_tx, rx) = mpsc::channel();
        let mut context = RuntimeContext::new();
        context.profiles.insert(
            "source".into(),
            crate::instrument::InstrumentProfile {
                driver: "SimulatedSource".into(),
                settings: json!({"fail_after": 0}).as_object().cloned().unwrap_or_default(),
            },
        );
        let read = Preferences::new()
            .with("task_id", "GetInstrumentProperty")
            .with("name", "read")
            .with("profile", "source")
            .with("property", "voltage");
        let state = run_worker(
            context,
            tree(vec![read, print("after", "never")]),
            &WorkerRegistries::default(),
            link.clone(),
            rx,
        );
        assert_eq!(state, EngineState::Interrupted);
        let messages = link.messages.lock();
        let failures = messages
            .iter()
            .find_map(|m| match m {
                WorkerMessage::Status { failures, .. } if !failures.is_empty() => Some(failures),
                _ => None,
            })
            .unwrap();
        assert_eq!(failures[0].task, "root/read");
    }
}
