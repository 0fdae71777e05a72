//! Formula evaluation against the task database.
//!
//! Task fields such as a sleep duration, a loop bound or a printed message
//! reference database entries with braces: `"{loop_value} * 2"`. Two
//! operations exist:
//!
//! - [`FormulaEngine::format`] replaces each `{name}` by the value found from
//!   the task's path (strings are inserted verbatim).
//! - [`FormulaEngine::evaluate`] substitutes values as script literals and
//!   evaluates the resulting expression with an embedded Rhai engine.
//!
//! The Rhai engine is configured with an operation limit so that a runaway
//! expression cannot stall a run.

use once_cell::sync::Lazy;
use regex::Regex;
use rhai::{Dynamic, Engine};
use serde_json::{Number, Value};

use crate::database::TaskDatabase;
use crate::error::{AppResult, DaqError};

/// Default number of Rhai operations allowed per evaluation.
pub const DEFAULT_OPERATION_LIMIT: u64 = 10_000;

#[allow(clippy::expect_used)]
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern is valid"));

/// Names referenced by `{...}` placeholders in `template`, in order.
pub fn referenced_entries(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].trim().to_string())
        .collect()
}

/// Replace every placeholder in `template` with `render(name)`.
pub fn substitute<F>(template: &str, mut render: F) -> AppResult<String>
where
    F: FnMut(&str) -> AppResult<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER.captures_iter(template) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        out.push_str(&template[last..whole.start]);
        out.push_str(&render(caps[1].trim())?);
        last = whole.end;
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Human readable rendering of a value: strings without quotes.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Rhai-based evaluator for task formulas.
pub struct FormulaEngine {
    engine: Engine,
}

impl std::fmt::Debug for FormulaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormulaEngine").finish_non_exhaustive()
    }
}

impl Default for FormulaEngine {
    fn default() -> Self {
        Self::with_limit(DEFAULT_OPERATION_LIMIT)
    }
}

impl FormulaEngine {
    /// Create an engine allowing at most `max_operations` per evaluation.
    pub fn with_limit(max_operations: u64) -> Self {
        let mut engine = Engine::new();
        engine.on_progress(move |count| {
            if count > max_operations {
                Some(
                    format!(
                        "Safety limit exceeded: maximum {} operations",
                        max_operations
                    )
                    .into(),
                )
            } else {
                None
            }
        });
        Self { engine }
    }

    /// Format `template`, reading placeholders from `path` upwards.
    pub fn format(&self, template: &str, path: &str, db: &TaskDatabase) -> AppResult<String> {
        substitute(template, |name| {
            db.get_value(path, name).map(|value| display_value(&value))
        })
    }

    /// Format then evaluate `template` as a Rhai expression.
    pub fn evaluate(&self, template: &str, path: &str, db: &TaskDatabase) -> AppResult<Value> {
        let script = substitute(template, |name| {
            db.get_value(path, name).map(|value| to_literal(&value))
        })?;
        self.eval_expression(&script)
    }

    /// Evaluate an expression that contains no placeholder.
    pub fn eval_expression(&self, script: &str) -> AppResult<Value> {
        let result: Dynamic = self
            .engine
            .eval_expression(script)
            .map_err(|e| DaqError::Evaluation(format!("'{}': {}", script, e)))?;
        dynamic_to_value(result)
    }
}

/// Script literal for a database value.
fn to_literal(value: &Value) -> String {
    match value {
        Value::Null => "()".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            // Rhai needs a decimal point to read a float.
            if n.is_f64() && !n.to_string().contains(['.', 'e', 'E']) {
                format!("{}.0", n)
            } else {
                n.to_string()
            }
        }
        Value::String(s) => Value::String(s.clone()).to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", Value::String(k.clone()), to_literal(v)))
                .collect();
            format!("#{{{}}}", fields.join(", "))
        }
    }
}

fn dynamic_to_value(value: Dynamic) -> AppResult<Value> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.as_float() {
        return Number::from_f64(f)
            .map(Value::Number)
            .ok_or_else(|| DaqError::Evaluation(format!("non finite result {}", f)));
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::String)
            .map_err(|e| DaqError::Evaluation(e.to_string()));
    }
    if value.is_array() {
        let items = value
            .try_cast::<rhai::Array>()
            .unwrap_or_default()
            .into_iter()
            .map(dynamic_to_value)
            .collect::<AppResult<Vec<_>>>()?;
        return Ok(Value::Array(items));
    }
    if value.is_map() {
        let mut out = serde_json::Map::new();
        for (k, v) in value.try_cast::<rhai::Map>().unwrap_or_default() {
            out.insert(k.to_string(), dynamic_to_value(v)?);
        }
        return Ok(Value::Object(out));
    }
    Err(DaqError::Evaluation(format!(
        "unsupported result type '{}'",
        value.type_name()
    )))
}
