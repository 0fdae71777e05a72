//! Simulated voltage source.
//!
//! Stands in for real hardware in tests and demo templates. Settings:
//!
//! | key | meaning | default |
//! |---|---|---|
//! | `identity` | value of the `identity` property | `SIM-SOURCE` |
//! | `voltage` | initial output voltage | `0.0` |
//! | `fail_after` | fail every property access after this many | never |
//! | `fail_open` | refuse to open the connection | `false` |

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use tracing::debug;

use super::{CapabilityTable, Driver, PropertyInfo};
use crate::error::{AppResult, DaqError};

/// Registered driver type name.
pub const DRIVER_TYPE: &str = "SimulatedSource";

static CAPABILITIES: Lazy<CapabilityTable<SimulatedSource>> = Lazy::new(|| {
    CapabilityTable::new()
        .read_write("voltage", SimulatedSource::voltage, SimulatedSource::set_voltage)
        .read_write("output", SimulatedSource::output, SimulatedSource::set_output)
        .readable("identity", SimulatedSource::identity)
});

/// In-memory voltage source with optional fault injection.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    identity: String,
    voltage: f64,
    output: bool,
    connected: bool,
    fail_open: bool,
    fail_after: Option<u64>,
    operations: u64,
}

impl SimulatedSource {
    /// Build from profile settings.
    pub fn from_settings(settings: &Map<String, Value>) -> AppResult<Self> {
        let identity = match settings.get("identity") {
            None => "SIM-SOURCE".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        };
        let voltage = match settings.get("voltage") {
            None => 0.0,
            Some(v) => v
                .as_f64()
                .ok_or_else(|| DaqError::Configuration(format!("invalid voltage {}", v)))?,
        };
        let fail_after = match settings.get("fail_after") {
            None => None,
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| DaqError::Configuration(format!("invalid fail_after {}", v)))?,
            ),
        };
        let fail_open = settings
            .get("fail_open")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            identity,
            voltage,
            output: false,
            connected: false,
            fail_open,
            fail_after,
            operations: 0,
        })
    }

    fn access(&mut self) -> AppResult<()> {
        if !self.connected {
            return Err(DaqError::InstrumentIo(format!(
                "{} is not connected",
                self.identity
            )));
        }
        self.operations += 1;
        match self.fail_after {
            Some(limit) if self.operations > limit => Err(DaqError::InstrumentIo(format!(
                "{} stopped responding after {} operations",
                self.identity, limit
            ))),
            _ => Ok(()),
        }
    }

    fn voltage(&mut self) -> AppResult<Value> {
        self.access()?;
        Ok(json!(self.voltage))
    }

    fn set_voltage(&mut self, value: &Value) -> AppResult<()> {
        self.access()?;
        self.voltage = value
            .as_f64()
            .ok_or_else(|| DaqError::InstrumentIo(format!("invalid voltage {}", value)))?;
        Ok(())
    }

    fn output(&mut self) -> AppResult<Value> {
        self.access()?;
        Ok(json!(self.output))
    }

    fn set_output(&mut self, value: &Value) -> AppResult<()> {
        self.access()?;
        self.output = match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
            Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "on" | "true" | "1"),
            other => {
                return Err(DaqError::InstrumentIo(format!(
                    "invalid output state {}",
                    other
                )))
            }
        };
        Ok(())
    }

    fn identity(&mut self) -> AppResult<Value> {
        self.access()?;
        Ok(json!(self.identity))
    }
}

impl Driver for SimulatedSource {
    fn driver_type(&self) -> &str {
        DRIVER_TYPE
    }

    fn open_connection(&mut self) -> AppResult<()> {
        if self.fail_open {
            return Err(DaqError::InstrumentIo(format!(
                "{} refused the connection",
                self.identity
            )));
        }
        debug!(identity = %self.identity, "Simulated source connected");
        self.connected = true;
        Ok(())
    }

    fn close_connection(&mut self) -> AppResult<()> {
        self.connected = false;
        Ok(())
    }

    fn check_connection(&self) -> bool {
        self.connected
    }

    fn get_property(&mut self, property: &str) -> AppResult<Value> {
        CAPABILITIES.get(self, property)
    }

    fn set_property(&mut self, property: &str, value: &Value) -> AppResult<()> {
        CAPABILITIES.set(self, property, value)
    }

    fn properties(&self) -> Vec<PropertyInfo> {
        CAPABILITIES.properties()
    }
}
