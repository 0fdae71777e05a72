//! Execution contracts wrapping a task's unit of work.
//!
//! Each task carries an [`ExecutionPlan`]: an ordered list of [`Contract`]s
//! applied around its body when it runs. The order is fixed:
//!
//! ```text
//! Stoppable ─▶ [Parallel | Wait] ─▶ [CrashIsolation] ─▶ body
//! ```
//!
//! - **Stoppable** (always first): skip the body if a stop was requested.
//! - **Parallel**: run the rest of the chain on a new thread, registered in
//!   the root's [`PendingOperations`] under a pool name, and return at once.
//! - **Wait**: join the pending threads (of some pools, or all) first.
//! - **CrashIsolation** (always last): turn an instrument I/O failure into a
//!   controlled stop of the whole tree.
//!
//! Moving CrashIsolation outside the stop check would let a crash abort a
//! task halfway through its writes, so [`ExecutionPlan::new`] refuses any
//! other ordering.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

use crate::error::{AppResult, DaqError};

/// Name of the pool used when a parallel task does not name one.
pub const DEFAULT_POOL: &str = "default";

// =============================================================================
// StopFlag
// =============================================================================

struct StopState {
    flag: AtomicBool,
    lock: Mutex<()>,
    signal: Condvar,
}

/// Cooperative stop request shared by every task of a tree.
///
/// Setting the flag also wakes every thread blocked in
/// [`StopFlag::wait_timeout`].
#[derive(Clone)]
pub struct StopFlag {
    state: Arc<StopState>,
}

impl std::fmt::Debug for StopFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StopFlag").field(&self.is_set()).finish()
    }
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    /// Create a cleared flag.
    pub fn new() -> Self {
        Self {
            state: Arc::new(StopState {
                flag: AtomicBool::new(false),
                lock: Mutex::new(()),
                signal: Condvar::new(),
            }),
        }
    }

    /// Request a stop and wake the waiters.
    pub fn set(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        let _guard = self.state.lock.lock();
        self.state.signal.notify_all();
    }

    /// Clear a previous request.
    pub fn clear(&self) {
        self.state.flag.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    pub fn is_set(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }

    /// Block for up to `timeout`; returns `true` if a stop was requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock.lock();
        while !self.is_set() {
            if self.state.signal.wait_until(&mut guard, deadline).timed_out() {
                return self.is_set();
            }
        }
        true
    }
}

// =============================================================================
// Pending operations
// =============================================================================

/// Which pools a [`Contract::Wait`] joins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitTarget {
    /// Every pending thread.
    All,
    /// Only the threads of the named pools.
    Pools(Vec<String>),
}

type OperationHandle = JoinHandle<AppResult<()>>;

/// Threads started by parallel tasks and not joined yet.
#[derive(Default)]
pub struct PendingOperations {
    pools: Mutex<BTreeMap<String, Vec<(String, OperationHandle)>>>,
}

impl std::fmt::Debug for PendingOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingOperations")
            .field("count", &self.len())
            .finish()
    }
}

impl PendingOperations {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a thread started by the task at `task`.
    pub fn register(&self, pool: &str, task: &str, handle: OperationHandle) {
        self.pools
            .lock()
            .entry(pool.to_string())
            .or_default()
            .push((task.to_string(), handle));
    }

    /// Number of threads not joined yet.
    pub fn len(&self) -> usize {
        self.pools.lock().values().map(Vec::len).sum()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Join the targeted threads.
    ///
    /// Every targeted thread is joined even if one fails; the first failure
    /// is returned. A thread that panicked is reported as a worker crash.
    pub fn wait(&self, target: &WaitTarget) -> AppResult<()> {
        let mut first_error = None;
        loop {
            let batch = self.take(target);
            if batch.is_empty() {
                break;
            }
            for (task, handle) in batch {
                let result = match handle.join() {
                    Ok(result) => result,
                    Err(payload) => Err(DaqError::WorkerCrash(format!(
                        "parallel task '{}' panicked: {}",
                        task,
                        panic_message(payload.as_ref())
                    ))),
                };
                if let Err(e) = result {
                    warn!(task = %task, error = %e, "Parallel task failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn take(&self, target: &WaitTarget) -> Vec<(String, OperationHandle)> {
        let mut pools = self.pools.lock();
        match target {
            WaitTarget::All => std::mem::take(&mut *pools).into_values().flatten().collect(),
            WaitTarget::Pools(names) => names
                .iter()
                .filter_map(|name| pools.remove(name))
                .flatten()
                .collect(),
        }
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Failure log
// =============================================================================

/// An instrument failure absorbed by the crash-isolation contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    /// Path and name of the task that failed, e.g. `root/read_voltage`.
    pub task: String,
    /// Error description.
    pub message: String,
}

/// Failures recorded during a run.
#[derive(Debug, Default)]
pub struct FailureLog {
    failures: Mutex<Vec<RunFailure>>,
}

impl FailureLog {
    /// Record a failure.
    pub fn record(&self, task: &str, message: impl Into<String>) {
        self.failures.lock().push(RunFailure {
            task: task.to_string(),
            message: message.into(),
        });
    }

    /// Copy of the recorded failures.
    pub fn snapshot(&self) -> Vec<RunFailure> {
        self.failures.lock().clone()
    }

    /// Forget previous failures.
    pub fn clear(&self) {
        self.failures.lock().clear();
    }
}

/// Run-time state shared by all contracts of one tree.
#[derive(Debug, Clone, Default)]
pub struct RunControl {
    /// Cooperative stop request.
    pub stop: StopFlag,
    /// Threads started by parallel tasks.
    pub pending: Arc<PendingOperations>,
    /// Failures absorbed by crash isolation.
    pub failures: Arc<FailureLog>,
}

// =============================================================================
// Contracts
// =============================================================================

/// One middleware around a task body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "contract", rename_all = "snake_case")]
pub enum Contract {
    /// Skip the body once a stop was requested.
    Stoppable,
    /// Run the body on a thread tracked in `pool`.
    Parallel { pool: String },
    /// Join pending threads before running the body.
    Wait { target: WaitTarget },
    /// Absorb instrument I/O failures into a controlled stop.
    CrashIsolation,
}

/// Work performed by a task once every contract let it through.
pub type TaskBody = Arc<dyn Fn() -> AppResult<()> + Send + Sync>;

/// Ordered, validated list of contracts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    contracts: Vec<Contract>,
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self {
            contracts: vec![Contract::Stoppable],
        }
    }
}

impl ExecutionPlan {
    /// Validate an explicit contract list.
    pub fn new(contracts: Vec<Contract>) -> AppResult<Self> {
        if contracts.first() != Some(&Contract::Stoppable) {
            return Err(DaqError::Build(
                "the stoppable contract must come first".to_string(),
            ));
        }
        if let Some(pos) = contracts.iter().position(|c| *c == Contract::CrashIsolation) {
            if pos != contracts.len() - 1 {
                return Err(DaqError::Build(
                    "crash isolation must be the innermost contract".to_string(),
                ));
            }
        }
        let scheduling = contracts
            .iter()
            .filter(|c| matches!(c, Contract::Parallel { .. } | Contract::Wait { .. }))
            .count();
        if scheduling > 1 {
            return Err(DaqError::Build(
                "a task is either parallel or waiting, not both".to_string(),
            ));
        }
        let waits_on_nothing = contracts.iter().any(|c| {
            matches!(c, Contract::Wait { target: WaitTarget::Pools(pools) } if pools.is_empty())
        });
        if waits_on_nothing {
            return Err(DaqError::Build(
                "a wait needs at least one pool, or '*' for all".to_string(),
            ));
        }
        if contracts.iter().filter(|c| **c == Contract::Stoppable).count() > 1
            || contracts.iter().filter(|c| **c == Contract::CrashIsolation).count() > 1
        {
            return Err(DaqError::Build("duplicated contract".to_string()));
        }
        Ok(Self { contracts })
    }

    /// Assemble a plan in the canonical order.
    pub fn from_options(
        parallel: Option<String>,
        wait: Option<WaitTarget>,
        crash_isolation: bool,
    ) -> AppResult<Self> {
        let mut contracts = vec![Contract::Stoppable];
        if let Some(pool) = parallel {
            contracts.push(Contract::Parallel { pool });
        }
        if let Some(target) = wait {
            contracts.push(Contract::Wait { target });
        }
        if crash_isolation {
            contracts.push(Contract::CrashIsolation);
        }
        Self::new(contracts)
    }

    /// The contracts, outermost first.
    pub fn contracts(&self) -> &[Contract] {
        &self.contracts
    }

    /// Pool name when the plan is parallel.
    pub fn parallel_pool(&self) -> Option<&str> {
        self.contracts.iter().find_map(|c| match c {
            Contract::Parallel { pool } => Some(pool.as_str()),
            _ => None,
        })
    }

    /// Wait target when the plan waits.
    pub fn wait_target(&self) -> Option<&WaitTarget> {
        self.contracts.iter().find_map(|c| match c {
            Contract::Wait { target } => Some(target),
            _ => None,
        })
    }

    /// Whether instrument failures are absorbed.
    pub fn isolates_crashes(&self) -> bool {
        self.contracts.contains(&Contract::CrashIsolation)
    }

    /// Run `body` for the task at `task` through every contract.
    pub fn run(&self, control: &RunControl, task: &str, body: TaskBody) -> AppResult<()> {
        run_chain(&self.contracts, control, task, body)
    }
}

fn run_chain(
    contracts: &[Contract],
    control: &RunControl,
    task: &str,
    body: TaskBody,
) -> AppResult<()> {
    let Some((contract, rest)) = contracts.split_first() else {
        return body();
    };

    match contract {
        Contract::Stoppable => {
            if control.stop.is_set() {
                debug!(task, "Stop requested, skipping task");
                return Ok(());
            }
            run_chain(rest, control, task, body)
        }
        Contract::Parallel { pool } => {
            let rest = rest.to_vec();
            let thread_control = control.clone();
            let thread_task = task.to_string();
            let handle = std::thread::Builder::new()
                .name(format!("task:{}", task))
                .spawn(move || run_chain(&rest, &thread_control, &thread_task, body))?;
            control.pending.register(pool, task, handle);
            debug!(task, pool = %pool, "Task started in parallel");
            Ok(())
        }
        Contract::Wait { target } => {
            control.pending.wait(target)?;
            run_chain(rest, control, task, body)
        }
        Contract::CrashIsolation => match run_chain(rest, control, task, body) {
            Err(e) if e.is_instrument_io() => {
                error!(task, error = %e, "Instrument failure, stopping the run");
                control.failures.record(task, e.to_string());
                control.stop.set();
                Ok(())
            }
            other => other,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_body(counter: Arc<AtomicUsize>) -> TaskBody {
        Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn test_plan_order_is_enforced() {
        assert!(ExecutionPlan::new(vec![Contract::CrashIsolation, Contract::Stoppable]).is_err());
        assert!(ExecutionPlan::new(vec![
            Contract::Stoppable,
            Contract::CrashIsolation,
            Contract::Wait {
                target: WaitTarget::All
            },
        ])
        .is_err());
        assert!(ExecutionPlan::new(vec![Contract::Parallel {
            pool: DEFAULT_POOL.into()
        }])
        .is_err());
        assert!(ExecutionPlan::from_options(
            Some(DEFAULT_POOL.into()),
            Some(WaitTarget::All),
            false
        )
        .is_err());
    }

    #[test]
    fn test_wait_on_empty_pool_list_is_rejected() {
        let err = ExecutionPlan::from_options(None, Some(WaitTarget::Pools(vec![])), false)
            .unwrap_err();
        assert!(matches!(err, DaqError::Build(_)));
        assert!(ExecutionPlan::from_options(
            None,
            Some(WaitTarget::Pools(vec!["instr".into()])),
            false
        )
        .is_ok());
    }

    #[test]
    fn test_from_options_uses_canonical_order() {
        let plan = ExecutionPlan::from_options(Some("instr".into()), None, true).unwrap();
        assert_eq!(
            plan.contracts(),
            &[
                Contract::Stoppable,
                Contract::Parallel {
                    pool: "instr".into()
                },
                Contract::CrashIsolation
            ]
        );
        assert_eq!(plan.parallel_pool(), Some("instr"));
        assert!(plan.isolates_crashes());
    }

    #[test]
    fn test_stop_flag_skips_body() {
        let control = RunControl::default();
        control.stop.set();
        let counter = Arc::new(AtomicUsize::new(0));
        ExecutionPlan::default()
            .run(&control, "root/print", counting_body(counter.clone()))
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_joins_parallel_siblings() {
        let control = RunControl::default();
        let order = Arc::new(Mutex::new(Vec::new()));

        let parallel = ExecutionPlan::from_options(Some(DEFAULT_POOL.into()), None, false).unwrap();
        let slow = order.clone();
        parallel
            .run(
                &control,
                "root/slow",
                Arc::new(move || {
                    std::thread::sleep(Duration::from_millis(100));
                    slow.lock().push("parallel");
                    Ok(())
                }),
            )
            .unwrap();
        assert_eq!(control.pending.len(), 1);

        let waiting = ExecutionPlan::from_options(None, Some(WaitTarget::All), false).unwrap();
        let after = order.clone();
        waiting
            .run(
                &control,
                "root/after",
                Arc::new(move || {
                    after.lock().push("wait");
                    Ok(())
                }),
            )
            .unwrap();

        assert_eq!(*order.lock(), vec!["parallel", "wait"]);
        assert!(control.pending.is_empty());
    }

    #[test]
    fn test_wait_on_named_pool_leaves_others_pending() {
        let control = RunControl::default();
        let parallel = |pool: &str| {
            ExecutionPlan::from_options(Some(pool.to_string()), None, false).unwrap()
        };
        let noop: TaskBody = Arc::new(|| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(())
        });
        parallel("instr").run(&control, "root/a", noop.clone()).unwrap();
        parallel("other").run(&control, "root/b", noop).unwrap();

        control
            .pending
            .wait(&WaitTarget::Pools(vec!["instr".into()]))
            .unwrap();
        assert_eq!(control.pending.len(), 1);
        control.pending.wait(&WaitTarget::All).unwrap();
        assert!(control.pending.is_empty());
    }

    #[test]
    fn test_crash_isolation_stops_the_run() {
        let control = RunControl::default();
        let plan = ExecutionPlan::from_options(None, None, true).unwrap();
        let result = plan.run(
            &control,
            "root/read",
            Arc::new(|| Err(DaqError::InstrumentIo("timeout".into()))),
        );
        assert!(result.is_ok());
        assert!(control.stop.is_set());
        let failures = control.failures.snapshot();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task, "root/read");
    }

    #[test]
    fn test_crash_isolation_lets_other_errors_through() {
        let control = RunControl::default();
        let plan = ExecutionPlan::from_options(None, None, true).unwrap();
        let result = plan.run(
            &control,
            "root/bad",
            Arc::new(|| Err(DaqError::Evaluation("1 +".into()))),
        );
        assert!(matches!(result, Err(DaqError::Evaluation(_))));
        assert!(!control.stop.is_set());
    }

    #[test]
    fn test_panicking_parallel_task_is_a_crash() {
        let control = RunControl::default();
        let plan = ExecutionPlan::from_options(Some(DEFAULT_POOL.into()), None, false).unwrap();
        #[allow(clippy::panic)]
        plan.run(&control, "root/boom", Arc::new(|| panic!("boom")))
            .unwrap();
        let err = control.pending.wait(&WaitTarget::All).unwrap_err();
        assert!(matches!(err, DaqError::WorkerCrash(ref msg) if msg.contains("boom")));
    }

    #[test]
    fn test_stop_flag_wakes_waiters() {
        let flag = StopFlag::new();
        let remote = flag.clone();
        let start = Instant::now();
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            remote.set();
        });
        assert!(flag.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(2));
        setter.join().unwrap();

        let idle = StopFlag::new();
        assert!(!idle.wait_timeout(Duration::from_millis(10)));
    }
}
