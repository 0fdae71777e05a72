//! Controller side of a run.
//!
//! The [`ExecutionEngine`] hosts one run at a time, either in a child
//! process (`<program> worker`, talking JSON lines over stdio) or on a
//! dedicated thread. Either way the worker is driven through the same
//! [`run_worker`] entry point and reports through the same messages.
//!
//! ## Channels
//!
//! - **control**: [`RunHandle::stop`] and [`RunHandle::force_stop`]. A stop
//!   that is not honoured within `stop_grace_ms` escalates to a force stop.
//! - **news**: namespace changes, fanned out to the linked monitors and to
//!   every [`ExecutionEngine::subscribe`] receiver.
//! - **log**: worker log records, replayed into the controller subscriber.
//!
//! ## State machine
//!
//! ```text
//! IDLE → PREPARING → RUNNING → {COMPLETED, INTERRUPTED, FAILED} → IDLE
//! ```
//!
//! A forced stop always ends `INTERRUPTED`. A worker that exits without
//! reporting a terminal state ends `FAILED`.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{ControlCommand, EngineState, LogRecord, RuntimeContext, WorkerMessage};
use super::worker::{run_worker, WorkerLink, WorkerRegistries};
use crate::config::{WorkerConfig, WorkerMode};
use crate::contracts::RunFailure;
use crate::error::{AppResult, DaqError};
use crate::logging;
use crate::monitor::MonitorHandle;
use crate::preferences::Preferences;

/// Capacity of the news broadcast channel.
const NEWS_CAPACITY: usize = 1024;

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// Run identifier from the [`RuntimeContext`].
    pub run_id: Uuid,
    /// Terminal state.
    pub state: EngineState,
    /// Failure reason, for `FAILED` runs.
    pub message: Option<String>,
    /// Instrument failures absorbed by crash isolation.
    pub failures: Vec<RunFailure>,
    /// When the run was started.
    pub started_at: DateTime<Utc>,
    /// When the worker was gone.
    pub finished_at: DateTime<Utc>,
    /// Exit code of a worker process.
    pub exit_code: Option<i32>,
}

/// Terminal status as reported by the worker.
#[derive(Debug, Default)]
struct Report {
    state: Option<EngineState>,
    message: Option<String>,
    failures: Vec<RunFailure>,
}

// =============================================================================
// Relay
// =============================================================================

/// Fan-out of worker messages to the engine state, monitors and subscribers.
#[derive(Clone)]
struct Relay {
    state: Arc<watch::Sender<EngineState>>,
    news: broadcast::Sender<WorkerMessage>,
    monitors: Arc<RwLock<Vec<MonitorHandle>>>,
}

impl Relay {
    fn new() -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        let (news, _) = broadcast::channel(NEWS_CAPACITY);
        Self {
            state: Arc::new(state),
            news,
            monitors: Arc::new(RwLock::new(Vec::new())),
        }
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Engine state changed");
        }
    }

    /// Route one worker message; terminal statuses are held in `report`.
    fn deliver(&self, message: WorkerMessage, report: &Mutex<Report>) {
        match &message {
            WorkerMessage::Status {
                state,
                message: reason,
                failures,
                ..
            } if state.is_terminal() => {
                let mut report = report.lock();
                report.state = Some(*state);
                report.message = reason.clone();
                report.failures = failures.clone();
                return;
            }
            WorkerMessage::Status { state, .. } => self.set_state(*state),
            WorkerMessage::News { path, value } => {
                for monitor in self.monitors.read().iter() {
                    monitor.lock().process_news(path, value.clone());
                }
            }
        }
        // No subscriber is not an error.
        let _ = self.news.send(message);
    }

    fn finish(&self, outcome: &RunOutcome) {
        let _ = self.news.send(WorkerMessage::Status {
            state: outcome.state,
            message: outcome.message.clone(),
            failures: outcome.failures.clone(),
            timestamp: outcome.finished_at,
        });
        self.set_state(outcome.state);
    }
}

/// Returns the engine to `IDLE` however the supervisor ends.
struct BusyGuard {
    busy: Arc<AtomicBool>,
    relay: Relay,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.relay.set_state(EngineState::Idle);
        self.busy.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Runs protocols in isolated workers, one at a time.
pub struct ExecutionEngine {
    config: WorkerConfig,
    registries: WorkerRegistries,
    log_level: String,
    relay: Relay,
    busy: Arc<AtomicBool>,
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("mode", &self.config.mode)
            .field("state", &self.state())
            .field("monitors", &self.relay.monitors.read().len())
            .finish()
    }
}

impl ExecutionEngine {
    /// Engine using `config` and the given registries.
    pub fn new(config: WorkerConfig, registries: WorkerRegistries) -> Self {
        Self {
            config,
            registries,
            log_level: "info".to_string(),
            relay: Relay::new(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Log filter handed to worker processes.
    pub fn with_log_level(mut self, level: &str) -> Self {
        self.log_level = level.to_string();
        self
    }

    /// Worker configuration in use.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Feed every future news update to `monitor`.
    pub fn add_monitor(&self, monitor: MonitorHandle) {
        self.relay.monitors.write().push(monitor);
    }

    /// Receiver of status and news messages.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
        self.relay.news.subscribe()
    }

    /// Receiver of state transitions.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.relay.state.subscribe()
    }

    /// Current state.
    pub fn state(&self) -> EngineState {
        *self.relay.state.borrow()
    }

    /// Start a run of the tree saved in `preferences`.
    ///
    /// Fails with [`DaqError::EngineBusy`] while another run is in progress.
    pub async fn start(
        &self,
        context: RuntimeContext,
        preferences: Preferences,
    ) -> AppResult<RunHandle> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DaqError::EngineBusy(format!(
                "cannot start while {}",
                self.state()
            )));
        }
        let guard = BusyGuard {
            busy: self.busy.clone(),
            relay: self.relay.clone(),
        };
        self.relay.set_state(EngineState::Preparing);

        let run_id = context.run_id;
        info!(run_id = %run_id, mode = ?self.config.mode, "Starting run");
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = match self.config.mode {
            WorkerMode::Process => {
                let worker = self.spawn_process(&context, &preferences).await?;
                tokio::spawn(supervise_process(
                    worker,
                    control_rx,
                    self.config.clone(),
                    self.relay.clone(),
                    run_id,
                    guard,
                ))
            }
            WorkerMode::Thread => {
                let worker = self.spawn_thread(context, preferences)?;
                tokio::spawn(supervise_thread(
                    worker,
                    control_rx,
                    self.config.clone(),
                    self.relay.clone(),
                    run_id,
                    guard,
                ))
            }
        };
        Ok(RunHandle {
            run_id,
            control: control_tx,
            task,
        })
    }

    async fn spawn_process(
        &self,
        context: &RuntimeContext,
        preferences: &Preferences,
    ) -> AppResult<ProcessWorker> {
        let program = match &self.config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let mut std_cmd = std::process::Command::new(&program);
        std_cmd.arg("worker").arg("--log-level").arg(&self.log_level);
        // Keep terminal interrupts for the controller, which relays them as STOP.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut std_cmd, 0);
        let mut cmd = Command::from(std_cmd);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!("Spawning worker: {:?}", cmd);
        let mut child = cmd.spawn().map_err(|e| {
            DaqError::WorkerCrash(format!(
                "could not start worker '{}': {}",
                program.display(),
                e
            ))
        })?;

        let missing = |what: &str| DaqError::WorkerCrash(format!("worker {} is not piped", what));
        let mut stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let setup = format!(
            "{}\n{}\n",
            serde_json::to_string(context)?,
            serde_json::to_string(preferences)?
        );
        stdin.write_all(setup.as_bytes()).await?;
        stdin.flush().await?;

        let report = Arc::new(Mutex::new(Report::default()));
        let relay = self.relay.clone();
        let news_report = report.clone();
        let news = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<WorkerMessage>(&line) {
                        Ok(message) => relay.deliver(message, &news_report),
                        Err(e) => warn!(error = %e, line = %line, "Unreadable worker message"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Worker stdout failed");
                        break;
                    }
                }
            }
        });
        let logs = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let record = LogRecord::parse(&line).unwrap_or_else(|| LogRecord::raw_error(&line));
                logging::replay(&record);
            }
        });

        Ok(ProcessWorker {
            child,
            stdin: Some(stdin),
            readers: vec![news, logs],
            report,
        })
    }

    fn spawn_thread(
        &self,
        context: RuntimeContext,
        preferences: Preferences,
    ) -> AppResult<ThreadWorker> {
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let registries = self.registries.clone();
        let link: Arc<dyn WorkerLink> = Arc::new(ChannelLink { tx: message_tx });

        std::thread::Builder::new()
            .name("protocol-worker".to_string())
            .spawn(move || {
                let state = run_worker(context, preferences, &registries, link, control_rx);
                let _ = done_tx.send(state);
            })?;

        let report = Arc::new(Mutex::new(Report::default()));
        let relay = self.relay.clone();
        let news_report = report.clone();
        let news = tokio::spawn(async move {
            while let Some(message) = message_rx.recv().await {
                relay.deliver(message, &news_report);
            }
        });

        Ok(ThreadWorker {
            control: control_tx,
            done: done_rx,
            readers: vec![news],
            report,
        })
    }
}

// =============================================================================
// Run handle
// =============================================================================

/// Control over a started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    control: mpsc::UnboundedSender<ControlCommand>,
    task: JoinHandle<AppResult<RunOutcome>>,
}

impl RunHandle {
    /// Identifier of the run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Ask the run to stop at the next stop check.
    ///
    /// Returns `false` when the run is already over.
    pub fn stop(&self) -> bool {
        self.control.send(ControlCommand::Stop).is_ok()
    }

    /// Terminate the worker now.
    pub fn force_stop(&self) -> bool {
        self.control.send(ControlCommand::ForceStop).is_ok()
    }

    /// Whether the supervisor is done.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Detached control channel, usable while another task waits.
    pub fn controller(&self) -> RunController {
        RunController {
            control: self.control.clone(),
        }
    }

    /// Wait for the run to end.
    pub async fn wait(self) -> AppResult<RunOutcome> {
        self.task
            .await
            .map_err(|e| DaqError::WorkerCrash(format!("run supervisor failed: {}", e)))?
    }
}

/// Cloneable stop / force-stop sender for a run.
#[derive(Debug, Clone)]
pub struct RunController {
    control: mpsc::UnboundedSender<ControlCommand>,
}

impl RunController {
    /// See [`RunHandle::stop`].
    pub fn stop(&self) -> bool {
        self.control.send(ControlCommand::Stop).is_ok()
    }

    /// See [`RunHandle::force_stop`].
    pub fn force_stop(&self) -> bool {
        self.control.send(ControlCommand::ForceStop).is_ok()
    }
}

// =============================================================================
// Supervision
// =============================================================================

struct ProcessWorker {
    child: Child,
    stdin: Option<ChildStdin>,
    readers: Vec<JoinHandle<()>>,
    report: Arc<Mutex<Report>>,
}

impl ProcessWorker {
    async fn send(&mut self, command: ControlCommand) {
        let Some(stdin) = self.stdin.as_mut() else {
            return;
        };
        let line = format!("{}\n", command.as_str());
        let sent = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        };
        if let Err(e) = sent.await {
            debug!(error = %e, "Worker stdin closed");
            self.stdin = None;
        }
    }

    async fn force_stop(&mut self) {
        self.send(ControlCommand::ForceStop).await;
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "Worker already gone");
        }
    }
}

struct ThreadWorker {
    control: std::sync::mpsc::Sender<ControlCommand>,
    done: oneshot::Receiver<EngineState>,
    readers: Vec<JoinHandle<()>>,
    report: Arc<Mutex<Report>>,
}

/// [`WorkerLink`] for thread-hosted workers.
struct ChannelLink {
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerLink for ChannelLink {
    fn send(&self, message: WorkerMessage) {
        let _ = self.tx.send(message);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Give the readers `config.drain_timeout()` to empty their channels.
async fn drain(mut readers: Vec<JoinHandle<()>>, config: &WorkerConfig) {
    let drained = tokio::time::timeout(config.drain_timeout(), async {
        for reader in readers.iter_mut() {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        warn!("Worker channels not drained in time");
        for reader in &readers {
            reader.abort();
        }
    }
}

fn outcome(
    run_id: Uuid,
    forced: bool,
    report: &Mutex<Report>,
    started_at: DateTime<Utc>,
    exit_code: Option<i32>,
) -> RunOutcome {
    let report = std::mem::take(&mut *report.lock());
    let (state, message) = match (forced, report.state) {
        (true, _) => (EngineState::Interrupted, None),
        (false, Some(state)) => (state, report.message),
        (false, None) => (
            EngineState::Failed,
            Some(match exit_code {
                Some(code) => format!("worker exited with code {} without a final status", code),
                None => "worker ended without a final status".to_string(),
            }),
        ),
    };
    RunOutcome {
        run_id,
        state,
        message,
        failures: report.failures,
        started_at,
        finished_at: Utc::now(),
        exit_code,
    }
}

async fn supervise_process(
    mut worker: ProcessWorker,
    mut control: mpsc::UnboundedReceiver<ControlCommand>,
    config: WorkerConfig,
    relay: Relay,
    run_id: Uuid,
    _guard: BusyGuard,
) -> AppResult<RunOutcome> {
    let started_at = Utc::now();
    let mut forced = false;
    let mut control_open = true;
    let mut deadline: Option<Instant> = None;

    let status = loop {
        tokio::select! {
            status = worker.child.wait() => break status,
            command = control.recv(), if control_open => match command {
                None => control_open = false,
                Some(ControlCommand::Stop) => {
                    info!(run_id = %run_id, "Stopping run");
                    worker.send(ControlCommand::Stop).await;
                    deadline.get_or_insert_with(|| Instant::now() + config.stop_grace());
                }
                Some(ControlCommand::ForceStop) if !forced => {
                    warn!(run_id = %run_id, "Force stopping run");
                    forced = true;
                    worker.force_stop().await;
                }
                Some(ControlCommand::ForceStop) => {}
            },
            _ = sleep_until(deadline), if deadline.is_some() && !forced => {
                warn!(run_id = %run_id, grace_ms = config.stop_grace_ms, "Worker ignored stop, killing it");
                forced = true;
                worker.force_stop().await;
            }
        }
    };
    drop(worker.stdin.take());

    let exit_code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            error!(error = %e, "Could not wait for worker");
            None
        }
    };
    drain(std::mem::take(&mut worker.readers), &config).await;

    let outcome = outcome(run_id, forced, &worker.report, started_at, exit_code);
    info!(run_id = %run_id, state = %outcome.state, exit_code = ?exit_code, "Run ended");
    relay.finish(&outcome);
    Ok(outcome)
}

async fn supervise_thread(
    mut worker: ThreadWorker,
    mut control: mpsc::UnboundedReceiver<ControlCommand>,
    config: WorkerConfig,
    relay: Relay,
    run_id: Uuid,
    _guard: BusyGuard,
) -> AppResult<RunOutcome> {
    let started_at = Utc::now();
    let mut forced = false;
    let mut control_open = true;
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = &mut worker.done => break,
            command = control.recv(), if control_open => match command {
                None => control_open = false,
                Some(ControlCommand::Stop) => {
                    info!(run_id = %run_id, "Stopping run");
                    let _ = worker.control.send(ControlCommand::Stop);
                    deadline.get_or_insert_with(|| Instant::now() + config.stop_grace());
                }
                Some(ControlCommand::ForceStop) => {
                    warn!(run_id = %run_id, "Force stopping run, detaching worker thread");
                    let _ = worker.control.send(ControlCommand::ForceStop);
                    forced = true;
                    break;
                }
            },
            _ = sleep_until(deadline), if deadline.is_some() => {
                warn!(run_id = %run_id, grace_ms = config.stop_grace_ms, "Worker ignored stop, detaching it");
                let _ = worker.control.send(ControlCommand::ForceStop);
                forced = true;
                break;
            }
        }
    }

    if forced {
        // A detached thread keeps its link alive; do not wait on it.
        for reader in &worker.readers {
            reader.abort();
        }
    } else {
        drain(std::mem::take(&mut worker.readers), &config).await;
    }

    let outcome = outcome(run_id, forced, &worker.report, started_at, None);
    info!(run_id = %run_id, state = %outcome.state, "Run ended");
    relay.finish(&outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::TextMonitor;
    use std::time::Duration;

    fn tree(children: Vec<Preferences>) -> Preferences {
        let mut prefs = Preferences::new().with("task_id", "Root").with("name", "root");
        prefs.set_children(children);
        prefs
    }

    fn sleep(name: &str, time: f64, interruptible: bool) -> Preferences {
        Preferences::new()
            .with("task_id", "Sleep")
            .with("name", name)
            .with("time", time)
            .with("interruptible", interruptible)
    }

    fn print(name: &str, message: &str) -> Preferences {
        Preferences::new()
            .with("task_id", "Print")
            .with("name", name)
            .with("message", message)
    }

    fn thread_engine(grace_ms: u64) -> ExecutionEngine {
        let config = WorkerConfig {
            mode: WorkerMode::Thread,
            stop_grace_ms: grace_ms,
            ..WorkerConfig::default()
        };
        ExecutionEngine::new(config, WorkerRegistries::default())
    }

    #[tokio::test]
    async fn test_thread_run_completes_with_news() {
        let engine = thread_engine(1000);
        let monitor = TextMonitor::new().into_handle();
        engine.add_monitor(monitor.clone());
        let mut news = engine.subscribe();

        let handle = engine
            .start(
                RuntimeContext::new(),
                tree(vec![
                    sleep("first", 0.2, true),
                    print("print", "x"),
                    sleep("last", 0.1, true),
                ]),
            )
            .await
            .unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, EngineState::Completed);
        assert_eq!(engine.state(), EngineState::Idle);

        let mut saw_news = false;
        while let Ok(message) = news.try_recv() {
            if let WorkerMessage::News { path, value } = message {
                if path == "root/print_message" && value == serde_json::json!("x") {
                    saw_news = true;
                }
            }
        }
        assert!(saw_news);
        assert_eq!(monitor.lock().entry("root/print_message").unwrap().value(), "x");
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let engine = thread_engine(1000);
        let handle = engine
            .start(RuntimeContext::new(), tree(vec![sleep("s", 5.0, true)]))
            .await
            .unwrap();
        let second = engine.start(RuntimeContext::new(), tree(vec![])).await;
        assert!(matches!(second, Err(DaqError::EngineBusy(_))));
        assert!(handle.stop());
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, EngineState::Interrupted);
    }

    #[tokio::test]
    async fn test_stop_escalates_after_grace() {
        let engine = thread_engine(100);
        let handle = engine
            .start(RuntimeContext::new(), tree(vec![sleep("stubborn", 3.0, false)]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        handle.stop();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, EngineState::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_build_failure_reports_failed() {
        let engine = thread_engine(1000);
        let bad = Preferences::new().with("task_id", "Nope").with("name", "n");
        let outcome = engine
            .start(RuntimeContext::new(), tree(vec![bad]))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.state, EngineState::Failed);
        assert!(outcome.message.is_some());
    }

    #[test]
    fn test_outcome_without_report_is_failed() {
        let report = Mutex::new(Report::default());
        let failed = outcome(Uuid::new_v4(), false, &report, Utc::now(), Some(101));
        assert_eq!(failed.state, EngineState::Failed);
        assert!(failed.message.unwrap().contains("101"));

        let report = Mutex::new(Report {
            state: Some(EngineState::Completed),
            ..Report::default()
        });
        let forced = outcome(Uuid::new_v4(), true, &report, Utc::now(), Some(130));
        assert_eq!(forced.state, EngineState::Interrupted);
    }
}
