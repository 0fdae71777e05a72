use serde_json::{Map, Value};
use std::collections::HashMap;

use super::simulated::{self, SimulatedSource};
use super::Driver;
use crate::error::{AppResult, DaqError};

type DriverFactory = Box<dyn Fn(&Map<String, Value>) -> AppResult<Box<dyn Driver>> + Send + Sync>;

/// Driver type name → factory.
pub struct DriverRegistry {
    factories: HashMap<String, DriverFactory>,
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.driver_types())
            .finish()
    }
}

impl DriverRegistry {
    /// Registry holding the built-in drivers.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(simulated::DRIVER_TYPE, |settings| {
            Ok(Box::new(SimulatedSource::from_settings(settings)?) as Box<dyn Driver>)
        });
        registry
    }

    /// Registry without any driver.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Add or replace a driver type.
    pub fn register<F>(&mut self, driver_type: &str, factory: F)
    where
        F: Fn(&Map<String, Value>) -> AppResult<Box<dyn Driver>> + Send + Sync + 'static,
    {
        self.factories
            .insert(driver_type.to_string(), Box::new(factory));
    }

    /// Instantiate a driver; the connection is not opened.
    pub fn create(
        &self,
        driver_type: &str,
        settings: &Map<String, Value>,
    ) -> AppResult<Box<dyn Driver>> {
        self.factories
            .get(driver_type)
            .ok_or_else(|| DaqError::Configuration(format!("Driver '{}' not found", driver_type)))
            .and_then(|factory| factory(settings))
    }

    /// Whether `driver_type` is known.
    pub fn contains(&self, driver_type: &str) -> bool {
        self.factories.contains_key(driver_type)
    }

    /// Known driver types, sorted.
    pub fn driver_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }
}
