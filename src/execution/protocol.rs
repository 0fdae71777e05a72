//! Messages crossing the controller / worker boundary.
//!
//! Every message is one line of JSON.
//!
//! ```text
//! controller ── stdin ──▶ worker     RuntimeContext, Preferences, then STOP / FORCE_STOP
//! controller ◀── stdout ── worker     {"kind":"status",..} and {"kind":"news",..}
//! controller ◀── stderr ── worker     tracing JSON log lines
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::contracts::RunFailure;
use crate::instrument::InstrumentProfile;
use crate::tasks::CheckOptions;

/// Everything a worker needs besides the task tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeContext {
    /// Identifier of the run, echoed in the outcome.
    pub run_id: Uuid,
    /// Entries forwarded as news; empty forwards everything.
    #[serde(default)]
    pub observed_entries: Vec<String>,
    /// Instrument profiles the tasks may use.
    #[serde(default)]
    pub profiles: BTreeMap<String, InstrumentProfile>,
    /// Options of the check run before the protocol.
    #[serde(default)]
    pub check: CheckOptions,
    /// Run without checking first.
    #[serde(default)]
    pub skip_check: bool,
}

impl RuntimeContext {
    /// Context with a fresh run id and no profile.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            observed_entries: Vec::new(),
            profiles: BTreeMap::new(),
            check: CheckOptions::default(),
            skip_check: false,
        }
    }

    /// Whether news about `path` should be forwarded.
    pub fn observes(&self, path: &str) -> bool {
        self.observed_entries.is_empty() || self.observed_entries.iter().any(|e| e == path)
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Command sent from the controller to a running worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Set the cooperative stop flag.
    Stop,
    /// Terminate the worker at once.
    ForceStop,
}

impl ControlCommand {
    /// Wire form of the command.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Stop => "STOP",
            ControlCommand::ForceStop => "FORCE_STOP",
        }
    }

    /// Parse a control line.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim() {
            "STOP" => Some(ControlCommand::Stop),
            "FORCE_STOP" => Some(ControlCommand::ForceStop),
            _ => None,
        }
    }
}

/// Lifecycle of a run.
///
/// ```text
/// IDLE → PREPARING → RUNNING → {COMPLETED, INTERRUPTED, FAILED} → IDLE
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EngineState {
    /// No run in progress.
    Idle,
    /// Building and checking the tree.
    Preparing,
    /// Tasks are running.
    Running,
    /// Every task ran.
    Completed,
    /// Stopped on request or by an instrument failure.
    Interrupted,
    /// The tree could not be built, did not pass its check, or crashed.
    Failed,
}

impl EngineState {
    /// Whether the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineState::Completed | EngineState::Interrupted | EngineState::Failed
        )
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Preparing => write!(f, "PREPARING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Interrupted => write!(f, "INTERRUPTED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Message sent from the worker to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// State transition.
    Status {
        /// New state.
        state: EngineState,
        /// Why a run failed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Instrument failures absorbed during the run.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failures: Vec<RunFailure>,
        /// When the transition happened.
        timestamp: DateTime<Utc>,
    },
    /// A namespace entry received a value.
    News {
        /// Full entry path.
        path: String,
        /// New value.
        value: Value,
    },
}

impl WorkerMessage {
    /// Status message stamped now.
    pub fn status(state: EngineState) -> Self {
        WorkerMessage::Status {
            state,
            message: None,
            failures: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Failed status carrying a reason.
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerMessage::Status {
            state: EngineState::Failed,
            message: Some(message.into()),
            failures: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// One log line emitted by the worker's JSON formatter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 time of the event.
    #[serde(default)]
    pub timestamp: Option<String>,
    /// `TRACE` to `ERROR`.
    #[serde(default)]
    pub level: String,
    /// Module that emitted the event.
    #[serde(default)]
    pub target: Option<String>,
    /// Event fields, including `message`.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl LogRecord {
    /// Parse a stderr line; `None` when it is not a JSON log record.
    pub fn parse(line: &str) -> Option<Self> {
        serde_json::from_str::<LogRecord>(line)
            .ok()
            .filter(|record| !record.level.is_empty())
    }

    /// Record for a raw line, such as a panic message.
    pub fn raw_error(line: &str) -> Self {
        let mut fields = Map::new();
        fields.insert("message".to_string(), Value::String(line.to_string()));
        Self {
            timestamp: Some(Utc::now().to_rfc3339()),
            level: "ERROR".to_string(),
            target: None,
            fields,
        }
    }

    /// The `message` field.
    pub fn message(&self) -> String {
        match self.fields.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    /// Every field but `message`, as `key=value` pairs.
    pub fn extra_fields(&self) -> String {
        self.fields
            .iter()
            .filter(|(k, _)| k.as_str() != "message")
            .map(|(k, v)| match v {
                Value::String(s) => format!("{}={}", k, s),
                other => format!("{}={}", k, other),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_control_commands() {
        assert_eq!(ControlCommand::parse("STOP\n"), Some(ControlCommand::Stop));
        assert_eq!(ControlCommand::parse("FORCE_STOP"), Some(ControlCommand::ForceStop));
        assert_eq!(ControlCommand::parse("PAUSE"), None);
        assert_eq!(ControlCommand::ForceStop.as_str(), "FORCE_STOP");
    }

    #[test]
    fn test_worker_message_wire_format() {
        let news = WorkerMessage::News {
            path: "root/print_message".into(),
            value: json!("x"),
        };
        let line = serde_json::to_string(&news).unwrap();
        assert_eq!(line, r#"{"kind":"news","path":"root/print_message","value":"x"}"#);

        let status: WorkerMessage = serde_json::from_str(
            r#"{"kind":"status","state":"INTERRUPTED","timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(
            status,
            WorkerMessage::Status {
                state: EngineState::Interrupted,
                ..
            }
        ));
    }

    #[test]
    fn test_log_record_parsing() {
        let line = r#"{"timestamp":"2024-05-01T10:00:00Z","level":"WARN","fields":{"message":"Task failed","task":"root/a"},"target":"rust_daq_protocol::tasks::node"}"#;
        let record = LogRecord::parse(line).unwrap();
        assert_eq!(record.level, "WARN");
        assert_eq!(record.message(), "Task failed");
        assert_eq!(record.extra_fields(), "task=root/a");

        assert!(LogRecord::parse("thread 'main' panicked at src/x.rs").is_none());
        assert_eq!(LogRecord::raw_error("boom").level, "ERROR");
    }

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Interrupted.to_string(), "INTERRUPTED");
        assert!(EngineState::Failed.is_terminal());
        assert!(!EngineState::Running.is_terminal());
    }

    #[test]
    fn test_observed_entries_filter() {
        let mut context = RuntimeContext::new();
        assert!(context.observes("root/anything"));
        context.observed_entries = vec!["root/print_message".into()];
        assert!(context.observes("root/print_message"));
        assert!(!context.observes("root/other"));
    }
}
