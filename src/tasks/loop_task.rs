use serde_json::Value;
use tracing::debug;

use super::check::{CheckOptions, CheckReport};
use super::composite::CompositeTask;
use super::node::TaskScope;
use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

/// Upper bound on the number of iterations of one loop.
pub const MAX_ITERATIONS: usize = 1_000_000;

/// Runs its children once per value of `start..=stop` by `step`.
///
/// Publishes the iteration number in `index` and the current value in
/// `value` before each pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopTask {
    /// First value (formula).
    pub start: String,
    /// Last value, included when reached exactly (formula).
    pub stop: String,
    /// Increment, may be negative (formula).
    pub step: String,
    /// Children run at each iteration.
    pub body: CompositeTask,
}

impl LoopTask {
    /// Loop over an empty body.
    pub fn new(start: impl ToString, stop: impl ToString, step: impl ToString) -> Self {
        Self {
            start: start.to_string(),
            stop: stop.to_string(),
            step: step.to_string(),
            body: CompositeTask::new(),
        }
    }

    pub(crate) fn entries() -> Vec<(String, Value)> {
        vec![
            ("index".to_string(), Value::from(0)),
            ("value".to_string(), Value::from(0)),
        ]
    }

    pub(crate) fn from_preferences(prefs: &Preferences, body: CompositeTask) -> AppResult<Self> {
        Ok(Self {
            start: prefs.require("start")?.to_string(),
            stop: prefs.require("stop")?.to_string(),
            step: prefs.parse_or("step", "1".to_string())?,
            body,
        })
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        prefs.set("start", &self.start);
        prefs.set("stop", &self.stop);
        prefs.set("step", &self.step);
    }

    /// Values taken by the loop.
    fn values(&self, scope: &TaskScope) -> AppResult<Vec<Value>> {
        let start = scope.evaluate(&self.start)?;
        let stop = scope.evaluate(&self.stop)?;
        let step = scope.evaluate(&self.step)?;

        if let (Some(a), Some(b), Some(s)) = (start.as_i64(), stop.as_i64(), step.as_i64()) {
            if s == 0 {
                return Err(DaqError::Evaluation("loop step must not be zero".into()));
            }
            let out_of_range =
                || DaqError::Evaluation(format!("loop bounds {}..={} step {} overflow", a, b, s));
            let span = b.checked_sub(a).ok_or_else(out_of_range)?;
            let count = if span != 0 && span.signum() != s.signum() {
                0
            } else {
                let steps = span.checked_div(s).ok_or_else(out_of_range)?;
                usize::try_from(steps)
                    .ok()
                    .and_then(|steps| steps.checked_add(1))
                    .ok_or_else(out_of_range)?
            };
            Self::ensure_bounded(count)?;
            // a + i * s stays between a and b once the count is bounded.
            return Ok((0..count)
                .map(|i| Value::from(a + i as i64 * s))
                .collect());
        }

        let number = |v: &Value, what: &str| {
            v.as_f64()
                .ok_or_else(|| DaqError::Evaluation(format!("loop {} {} is not a number", what, v)))
        };
        let (a, b, s) = (number(&start, "start")?, number(&stop, "stop")?, number(&step, "step")?);
        if s == 0.0 || !s.is_finite() {
            return Err(DaqError::Evaluation("loop step must be a finite non-zero number".into()));
        }
        let span = (b - a) / s;
        if !span.is_finite() {
            return Err(DaqError::Evaluation(format!(
                "loop bounds {}..={} step {} are not finite",
                a, b, s
            )));
        }
        let count = if span < -1e-9 {
            0
        } else if span >= MAX_ITERATIONS as f64 {
            MAX_ITERATIONS + 1
        } else {
            (span + 1e-9).floor() as usize + 1
        };
        Self::ensure_bounded(count)?;
        Ok((0..count).map(|i| Value::from(a + i as f64 * s)).collect())
    }

    fn ensure_bounded(count: usize) -> AppResult<()> {
        if count > MAX_ITERATIONS {
            return Err(DaqError::Evaluation(format!(
                "loop would run {} iterations, more than {}",
                count, MAX_ITERATIONS
            )));
        }
        Ok(())
    }

    pub(crate) fn check(&self, scope: &TaskScope, options: &CheckOptions, report: &mut CheckReport) {
        match self.values(scope) {
            Ok(values) => {
                let first = values.first().cloned().unwrap_or(Value::Null);
                let written = scope
                    .write("index", Value::from(0))
                    .and_then(|_| scope.write("value", first));
                if let Err(e) = written {
                    report.fail(&scope.full_path(), e.to_string());
                }
            }
            Err(e) => report.fail(&scope.full_path(), e.to_string()),
        }
        report.merge(self.body.check(options));
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        let values = self.values(scope)?;
        debug!(task = %scope.full_path(), iterations = values.len(), "Loop started");
        for (index, value) in values.into_iter().enumerate() {
            if scope.stop_requested() {
                debug!(task = %scope.full_path(), index, "Loop stopped");
                break;
            }
            scope.write("index", Value::from(index))?;
            scope.write("value", value)?;
            self.body.perform()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::leaves::{FormulaTask, PrintTask};
    use crate::tasks::node::{TaskKind, TaskNode};
    use crate::tasks::root::RootTask;
    use serde_json::json;

    fn sweep(start: &str, stop: &str, step: &str) -> RootTask {
        let mut root = RootTask::default();
        let mut sweep = TaskNode::new("sweep", TaskKind::Loop(LoopTask::new(start, stop, step)));
        sweep
            .add_child(
                0,
                TaskNode::new(
                    "acc",
                    TaskKind::Formula(FormulaTask::new(vec![(
                        "last".to_string(),
                        "{sweep_value} * 10".to_string(),
                    )])),
                ),
            )
            .unwrap();
        root.push_child(sweep).unwrap();
        root
    }

    #[test]
    fn test_integer_range_includes_stop() {
        let root = sweep("1", "3", "1");
        root.perform().unwrap();
        let db = root.database();
        assert_eq!(db.get_value("root", "sweep_index").unwrap(), json!(2));
        assert_eq!(db.get_value("root", "sweep_value").unwrap(), json!(3));
        assert_eq!(db.get_value("root/sweep", "acc_last").unwrap(), json!(30));
    }

    #[test]
    fn test_float_range_and_negative_step() {
        let root = sweep("1.0", "0.0", "-0.5");
        root.perform().unwrap();
        let db = root.database();
        assert_eq!(db.get_value("root", "sweep_index").unwrap(), json!(2));
        assert_eq!(db.get_value("root", "sweep_value").unwrap(), json!(0.0));
    }

    #[test]
    fn test_empty_range_runs_nothing() {
        let root = sweep("5", "1", "1");
        root.perform().unwrap();
        assert_eq!(
            root.database().get_value("root/sweep", "acc_last").unwrap(),
            json!(null)
        );
    }

    #[test]
    fn test_zero_step_fails_check() {
        let root = sweep("0", "1", "0");
        let report = root.check(&CheckOptions::default());
        assert!(!report.failures_of("root/sweep").is_empty());
    }

    #[test]
    fn test_extreme_integer_bounds_fail_check() {
        for (start, stop, step) in [
            ("-9000000000000000000", "9000000000000000000", "1"),
            ("9000000000000000000", "-9000000000000000000", "-1"),
            ("0", "9000000000000000000", "1"),
        ] {
            let root = sweep(start, stop, step);
            let report = root.check(&CheckOptions::default());
            assert!(
                !report.failures_of("root/sweep").is_empty(),
                "{}..={} step {}",
                start,
                stop,
                step
            );
        }
    }

    #[test]
    fn test_extreme_float_bounds_fail_check() {
        for (start, stop, step) in [("0.0", "1e300", "1e-300"), ("-1e308", "1e308", "1.0")] {
            let root = sweep(start, stop, step);
            let report = root.check(&CheckOptions::default());
            assert!(!report.failures_of("root/sweep").is_empty());
        }
    }

    #[test]
    fn test_single_value_range() {
        let root = sweep("7", "7", "-2");
        root.perform().unwrap();
        assert_eq!(root.database().get_value("root", "sweep_value").unwrap(), json!(7));
    }

    #[test]
    fn test_stop_ends_loop() {
        let mut root = RootTask::default();
        let mut sweep = TaskNode::new("sweep", TaskKind::Loop(LoopTask::new(0, 100, 1)));
        sweep
            .add_child(0, TaskNode::new("p", TaskKind::Print(PrintTask::new("{sweep_index}"))))
            .unwrap();
        root.push_child(sweep).unwrap();
        root.stop_flag().set();
        root.perform().unwrap();
        assert_eq!(root.database().get_value("root", "sweep_index").unwrap(), json!(0));
    }
}
