//! Leaf tasks that only touch the namespace.

use serde_json::Value;
use std::time::Duration;
use tracing::info;

use super::check::CheckReport;
use super::node::TaskScope;
use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

// =============================================================================
// Sleep
// =============================================================================

/// Wait for a number of seconds given by a formula.
#[derive(Debug, Clone, PartialEq)]
pub struct SleepTask {
    /// Duration in seconds.
    pub time: String,
    /// Wake up early when a stop is requested.
    pub interruptible: bool,
}

impl SleepTask {
    /// Interruptible sleep of `time` seconds.
    pub fn new(time: impl ToString) -> Self {
        Self {
            time: time.to_string(),
            interruptible: true,
        }
    }

    /// Sleep ignoring stop requests until the end.
    pub fn uninterruptible(time: impl ToString) -> Self {
        Self {
            interruptible: false,
            ..Self::new(time)
        }
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self {
            time: prefs.require("time")?.to_string(),
            interruptible: prefs.parse_or("interruptible", true)?,
        })
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        prefs.set("time", &self.time);
        prefs.set("interruptible", self.interruptible);
    }

    fn duration(&self, scope: &TaskScope) -> AppResult<Duration> {
        let seconds = scope.evaluate_number(&self.time)?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(DaqError::Evaluation(format!(
                "sleep time must be a positive number of seconds, got {}",
                seconds
            )));
        }
        Ok(Duration::from_secs_f64(seconds))
    }

    pub(crate) fn check(&self, scope: &TaskScope, report: &mut CheckReport) {
        if let Err(e) = self.duration(scope) {
            report.fail(&scope.full_path(), e.to_string());
        }
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        let duration = self.duration(scope)?;
        if self.interruptible {
            scope.context.stop_flag().wait_timeout(duration);
        } else {
            std::thread::sleep(duration);
        }
        Ok(())
    }
}

// =============================================================================
// Print
// =============================================================================

/// Format a message and publish it in the `message` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PrintTask {
    /// Format string, `{name}` placeholders read from the namespace.
    pub message: String,
}

impl PrintTask {
    /// Print `message`.
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub(crate) fn entries() -> Vec<(String, Value)> {
        vec![("message".to_string(), Value::String(String::new()))]
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self::new(prefs.require("message")?))
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        prefs.set("message", &self.message);
    }

    pub(crate) fn check(&self, scope: &TaskScope, report: &mut CheckReport) {
        match scope.format(&self.message) {
            Ok(text) => {
                if let Err(e) = scope.write("message", Value::String(text)) {
                    report.fail(&scope.full_path(), e.to_string());
                }
            }
            Err(e) => report.fail(&scope.full_path(), e.to_string()),
        }
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        let text = scope.format(&self.message)?;
        info!(task = %scope.full_path(), "{}", text);
        scope.write("message", Value::String(text))
    }
}

// =============================================================================
// Definition and Formula
// =============================================================================

fn parse_pairs(prefs: &Preferences, key: &str) -> AppResult<Vec<(String, String)>> {
    let raw = prefs.require(key)?;
    serde_json::from_str(raw)
        .map_err(|e| DaqError::Build(format!("field '{}' is not a list of pairs: {}", key, e)))
}

fn write_pairs(prefs: &mut Preferences, key: &str, pairs: &[(String, String)]) {
    prefs.set(
        key,
        serde_json::to_string(pairs).unwrap_or_else(|_| "[]".to_string()),
    );
}

fn evaluate_pairs(scope: &TaskScope, pairs: &[(String, String)]) -> AppResult<()> {
    for (entry, formula) in pairs {
        let value = scope.evaluate(formula)?;
        scope.write(entry, value)?;
    }
    Ok(())
}

fn check_pairs(scope: &TaskScope, pairs: &[(String, String)], report: &mut CheckReport) {
    for (entry, formula) in pairs {
        match scope.evaluate(formula) {
            Ok(value) => {
                if let Err(e) = scope.write(entry, value) {
                    report.fail(&scope.full_path(), e.to_string());
                }
            }
            Err(e) => report.fail(&scope.full_path(), format!("{}: {}", entry, e)),
        }
    }
}

/// Named constants.
///
/// Evaluated during the check already, so later tasks can be checked against
/// the real values.
#[derive(Debug, Clone, PartialEq)]
pub struct DefinitionTask {
    /// `(entry, formula)` in evaluation order.
    pub definitions: Vec<(String, String)>,
}

impl DefinitionTask {
    /// Task defining the given constants.
    pub fn new(definitions: Vec<(String, String)>) -> Self {
        Self { definitions }
    }

    pub(crate) fn entries(&self) -> Vec<(String, Value)> {
        self.definitions
            .iter()
            .map(|(entry, _)| (entry.clone(), Value::Null))
            .collect()
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self::new(parse_pairs(prefs, "definitions")?))
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        write_pairs(prefs, "definitions", &self.definitions);
    }

    pub(crate) fn check(&self, scope: &TaskScope, report: &mut CheckReport) {
        check_pairs(scope, &self.definitions, report);
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        evaluate_pairs(scope, &self.definitions)
    }
}

/// Values computed from other entries when the task runs.
#[derive(Debug, Clone, PartialEq)]
pub struct FormulaTask {
    /// `(entry, formula)` in evaluation order.
    pub formulas: Vec<(String, String)>,
}

impl FormulaTask {
    /// Task computing the given formulas.
    pub fn new(formulas: Vec<(String, String)>) -> Self {
        Self { formulas }
    }

    pub(crate) fn entries(&self) -> Vec<(String, Value)> {
        self.formulas
            .iter()
            .map(|(entry, _)| (entry.clone(), Value::Null))
            .collect()
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self::new(parse_pairs(prefs, "formulas")?))
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        write_pairs(prefs, "formulas", &self.formulas);
    }

    pub(crate) fn check(&self, scope: &TaskScope, report: &mut CheckReport) {
        check_pairs(scope, &self.formulas, report);
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        evaluate_pairs(scope, &self.formulas)
    }
}
