//! Connections shared by the tasks of one run.
//!
//! A connection is opened the first time a task uses its profile and stays
//! open until [`InstrumentPool::close_all`]. Each driver sits behind its own
//! lock, so parallel tasks talking to different instruments never wait on
//! each other.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use super::{Driver, DriverRegistry, InstrumentProfile, PropertyInfo};
use crate::error::{AppResult, DaqError};

type SharedDriver = Arc<Mutex<Box<dyn Driver>>>;

/// Profile name → lazily opened driver.
pub struct InstrumentPool {
    registry: Arc<DriverRegistry>,
    profiles: BTreeMap<String, InstrumentProfile>,
    connections: Mutex<HashMap<String, SharedDriver>>,
}

impl std::fmt::Debug for InstrumentPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentPool")
            .field("profiles", &self.profiles.keys().collect::<Vec<_>>())
            .field("open", &self.connections.lock().len())
            .finish()
    }
}

impl Default for InstrumentPool {
    fn default() -> Self {
        Self::new(Arc::new(DriverRegistry::new()), BTreeMap::new())
    }
}

impl InstrumentPool {
    /// Pool over `profiles`; nothing is opened yet.
    pub fn new(registry: Arc<DriverRegistry>, profiles: BTreeMap<String, InstrumentProfile>) -> Self {
        Self {
            registry,
            profiles,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Configured profile names.
    pub fn profile_names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }

    /// Configured profiles.
    pub fn profiles(&self) -> &BTreeMap<String, InstrumentProfile> {
        &self.profiles
    }

    /// Properties offered by the driver of `profile`, without connecting.
    pub fn properties(&self, profile: &str) -> AppResult<Vec<PropertyInfo>> {
        let config = self.profile(profile)?;
        let driver = self.registry.create(&config.driver, &config.settings)?;
        Ok(driver.properties())
    }

    /// Open `profile` and verify the connection, then release it.
    pub fn test_connection(&self, profile: &str) -> AppResult<()> {
        let config = self.profile(profile)?;
        let mut driver = self.registry.create(&config.driver, &config.settings)?;
        driver.open_connection()?;
        let alive = driver.check_connection();
        driver.close_connection()?;
        if alive {
            Ok(())
        } else {
            Err(DaqError::InstrumentIo(format!(
                "connection check failed for profile '{}'",
                profile
            )))
        }
    }

    /// Run `f` with the driver of `profile`, opening it on first use and
    /// reopening it if the connection was lost.
    pub fn with_driver<T, F>(&self, profile: &str, f: F) -> AppResult<T>
    where
        F: FnOnce(&mut dyn Driver) -> AppResult<T>,
    {
        let driver = self.connection(profile)?;
        let mut driver = driver.lock();
        if !driver.check_connection() {
            warn!(profile, "Connection lost, reopening");
            driver.reopen_connection()?;
        }
        f(&mut **driver)
    }

    /// Close every open connection. Errors are logged, not returned.
    pub fn close_all(&self) {
        let connections: Vec<(String, SharedDriver)> = self.connections.lock().drain().collect();
        for (profile, driver) in connections {
            if let Err(e) = driver.lock().close_connection() {
                warn!(profile = %profile, error = %e, "Failed to close instrument connection");
            }
        }
    }

    /// Number of open connections.
    pub fn open_count(&self) -> usize {
        self.connections.lock().len()
    }

    fn profile(&self, profile: &str) -> AppResult<&InstrumentProfile> {
        self.profiles.get(profile).ok_or_else(|| {
            DaqError::Configuration(format!("unknown instrument profile '{}'", profile))
        })
    }

    fn connection(&self, profile: &str) -> AppResult<SharedDriver> {
        let mut connections = self.connections.lock();
        if let Some(driver) = connections.get(profile) {
            return Ok(driver.clone());
        }
        let config = self.profile(profile)?;
        let mut driver = self.registry.create(&config.driver, &config.settings)?;
        driver.open_connection()?;
        info!(profile, driver = %config.driver, "Instrument connection opened");
        let driver: SharedDriver = Arc::new(Mutex::new(driver));
        connections.insert(profile.to_string(), driver.clone());
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::simulated;
    use serde_json::json;

    fn pool() -> InstrumentPool {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "source".to_string(),
            InstrumentProfile {
                driver: simulated::DRIVER_TYPE.to_string(),
                settings: json!({"voltage": 2.0}).as_object().cloned().unwrap_or_default(),
            },
        );
        InstrumentPool::new(Arc::new(DriverRegistry::new()), profiles)
    }

    #[test]
    fn test_connection_opened_once() {
        let pool = pool();
        assert_eq!(pool.open_count(), 0);
        pool.with_driver("source", |d| d.set_property("voltage", &json!(5.0)))
            .unwrap();
        let v = pool.with_driver("source", |d| d.get_property("voltage")).unwrap();
        assert_eq!(v, json!(5.0));
        assert_eq!(pool.open_count(), 1);

        pool.close_all();
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_unknown_profile() {
        let pool = pool();
        assert!(matches!(
            pool.with_driver("missing", |d| d.get_property("voltage")),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_properties_without_connecting() {
        let pool = pool();
        let names: Vec<String> = pool
            .properties("source")
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["identity", "output", "voltage"]);
        assert_eq!(pool.open_count(), 0);
        pool.test_connection("source").unwrap();
    }
}
