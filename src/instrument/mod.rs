//! Instrument driver contract.
//!
//! Tasks never talk to hardware directly. They name a *profile* (a configured
//! connection such as `source_a`), and the [`InstrumentPool`] hands them the
//! [`Driver`] bound to it. Drivers expose their properties through a
//! [`CapabilityTable`] declared once per driver type, and every failure they
//! report is a [`DaqError::InstrumentIo`] so that the crash-isolation contract
//! can recognise it.
//!
//! ## Modules
//!
//! - [`registry`]: driver type name → factory.
//! - [`simulated`]: the built-in `SimulatedSource` used by tests and demos.
//! - [`pool`]: lazily opened connections shared by all tasks of a run.

pub mod pool;
pub mod registry;
pub mod simulated;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{AppResult, DaqError};

pub use pool::InstrumentPool;
pub use registry::DriverRegistry;
pub use simulated::SimulatedSource;

/// Configured connection: which driver to use and its settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstrumentProfile {
    /// Driver type name as registered in the [`DriverRegistry`].
    pub driver: String,
    /// Driver specific settings (address, initial state, ...).
    #[serde(default)]
    pub settings: Map<String, Value>,
}

/// Connection to one instrument.
pub trait Driver: Send {
    /// Registered type name of this driver.
    fn driver_type(&self) -> &str;

    /// Open the connection.
    fn open_connection(&mut self) -> AppResult<()>;

    /// Close the connection. Closing a closed driver is not an error.
    fn close_connection(&mut self) -> AppResult<()>;

    /// Close then open again.
    fn reopen_connection(&mut self) -> AppResult<()> {
        self.close_connection()?;
        self.open_connection()
    }

    /// Whether the connection is usable.
    fn check_connection(&self) -> bool;

    /// Read a property.
    fn get_property(&mut self, property: &str) -> AppResult<Value>;

    /// Write a property.
    fn set_property(&mut self, property: &str, value: &Value) -> AppResult<()>;

    /// Names of the readable and writable properties.
    fn properties(&self) -> Vec<PropertyInfo>;
}

/// Access rights of one property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    /// Property name.
    pub name: String,
    /// Whether a getter exists.
    pub readable: bool,
    /// Whether a setter exists.
    pub writable: bool,
}

/// Reads a property from a driver.
pub type Getter<D> = fn(&mut D) -> AppResult<Value>;

/// Writes a property of a driver.
pub type Setter<D> = fn(&mut D, &Value) -> AppResult<()>;

struct Capability<D> {
    getter: Option<Getter<D>>,
    setter: Option<Setter<D>>,
}

/// Declared property accessors of a driver type.
///
/// ```text
/// CapabilityTable::new()
///     .read_write("voltage", get_voltage, set_voltage)
///     .readable("identity", get_identity)
/// ```
pub struct CapabilityTable<D> {
    entries: BTreeMap<&'static str, Capability<D>>,
}

impl<D> Default for CapabilityTable<D> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<D> CapabilityTable<D> {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a read-only property.
    pub fn readable(mut self, name: &'static str, getter: Getter<D>) -> Self {
        self.entries.insert(
            name,
            Capability {
                getter: Some(getter),
                setter: None,
            },
        );
        self
    }

    /// Declare a write-only property.
    pub fn writable(mut self, name: &'static str, setter: Setter<D>) -> Self {
        self.entries.insert(
            name,
            Capability {
                getter: None,
                setter: Some(setter),
            },
        );
        self
    }

    /// Declare a read-write property.
    pub fn read_write(mut self, name: &'static str, getter: Getter<D>, setter: Setter<D>) -> Self {
        self.entries.insert(
            name,
            Capability {
                getter: Some(getter),
                setter: Some(setter),
            },
        );
        self
    }

    /// Call the getter of `property`.
    pub fn get(&self, driver: &mut D, property: &str) -> AppResult<Value> {
        let getter = self
            .entries
            .get(property)
            .and_then(|c| c.getter)
            .ok_or_else(|| {
                DaqError::InstrumentIo(format!("property '{}' is not readable", property))
            })?;
        getter(driver)
    }

    /// Call the setter of `property`.
    pub fn set(&self, driver: &mut D, property: &str, value: &Value) -> AppResult<()> {
        let setter = self
            .entries
            .get(property)
            .and_then(|c| c.setter)
            .ok_or_else(|| {
                DaqError::InstrumentIo(format!("property '{}' is not writable", property))
            })?;
        setter(driver, value)
    }

    /// Declared properties, sorted by name.
    pub fn properties(&self) -> Vec<PropertyInfo> {
        self.entries
            .iter()
            .map(|(name, c)| PropertyInfo {
                name: name.to_string(),
                readable: c.getter.is_some(),
                writable: c.setter.is_some(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct Counter {
        value: i64,
    }

    fn table() -> CapabilityTable<Counter> {
        CapabilityTable::new()
            .read_write(
                "value",
                |c: &mut Counter| Ok(json!(c.value)),
                |c: &mut Counter, v: &Value| {
                    c.value = v
                        .as_i64()
                        .ok_or_else(|| DaqError::InstrumentIo("not an integer".into()))?;
                    Ok(())
                },
            )
            .writable("reset", |c: &mut Counter, _: &Value| {
                c.value = 0;
                Ok(())
            })
    }

    #[test]
    fn test_capability_table_dispatch() {
        let table = table();
        let mut counter = Counter::default();
        table.set(&mut counter, "value", &json!(4)).unwrap();
        assert_eq!(table.get(&mut counter, "value").unwrap(), json!(4));
        table.set(&mut counter, "reset", &Value::Null).unwrap();
        assert_eq!(counter.value, 0);
    }

    #[test]
    fn test_missing_accessor_is_instrument_error() {
        let table = table();
        let mut counter = Counter::default();
        assert!(table.get(&mut counter, "reset").unwrap_err().is_instrument_io());
        assert!(table
            .set(&mut counter, "unknown", &json!(1))
            .unwrap_err()
            .is_instrument_io());
    }

    #[test]
    fn test_properties_listing() {
        let props = table().properties();
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].name, "reset");
        assert!(!props[0].readable && props[0].writable);
        assert!(props[1].readable && props[1].writable);
    }
}
