//! Tasks driving instruments through the connection pool.
//!
//! Both tasks publish the value read or written in their `value` entry. They
//! are built with crash isolation on, so a driver failure stops the tree
//! instead of failing the run.

use serde_json::Value;
use tracing::info;

use super::check::{CheckOptions, CheckReport};
use super::node::TaskScope;
use crate::error::AppResult;
use crate::preferences::Preferences;

fn value_entry() -> Vec<(String, Value)> {
    vec![("value".to_string(), Value::Null)]
}

/// Verify that `profile` exists and offers `property` with the needed access.
fn check_property(
    scope: &TaskScope,
    options: &CheckOptions,
    profile: &str,
    property: &str,
    write: bool,
    report: &mut CheckReport,
) {
    let task = scope.full_path();
    let pool = &scope.context.instruments;
    let properties = match pool.properties(profile) {
        Ok(properties) => properties,
        Err(e) => {
            report.fail(&task, e.to_string());
            return;
        }
    };
    match properties.iter().find(|p| p.name == property) {
        None => report.fail(
            &task,
            format!("profile '{}' has no property '{}'", profile, property),
        ),
        Some(info) if write && !info.writable => {
            report.fail(&task, format!("property '{}' is read-only", property))
        }
        Some(info) if !write && !info.readable => {
            report.fail(&task, format!("property '{}' is write-only", property))
        }
        Some(_) => {}
    }
    if options.test_instruments {
        if let Err(e) = pool.test_connection(profile) {
            report.fail(&task, e.to_string());
        }
    }
}

/// Read a property and store it in `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct GetPropertyTask {
    /// Instrument profile name.
    pub profile: String,
    /// Property to read.
    pub property: String,
}

impl GetPropertyTask {
    /// Read `property` from `profile`.
    pub fn new(profile: &str, property: &str) -> Self {
        Self {
            profile: profile.to_string(),
            property: property.to_string(),
        }
    }

    pub(crate) fn entries() -> Vec<(String, Value)> {
        value_entry()
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self::new(prefs.require("profile")?, prefs.require("property")?))
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        prefs.set("profile", &self.profile);
        prefs.set("property", &self.property);
    }

    pub(crate) fn check(&self, scope: &TaskScope, options: &CheckOptions, report: &mut CheckReport) {
        check_property(scope, options, &self.profile, &self.property, false, report);
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        let value = scope
            .context
            .instruments
            .with_driver(&self.profile, |driver| driver.get_property(&self.property))?;
        scope.write("value", value)
    }
}

/// Evaluate a formula, write it to a property and store it in `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct SetPropertyTask {
    /// Instrument profile name.
    pub profile: String,
    /// Property to write.
    pub property: String,
    /// Formula giving the value.
    pub value: String,
}

impl SetPropertyTask {
    /// Write `value` to `property` of `profile`.
    pub fn new(profile: &str, property: &str, value: impl ToString) -> Self {
        Self {
            profile: profile.to_string(),
            property: property.to_string(),
            value: value.to_string(),
        }
    }

    pub(crate) fn entries() -> Vec<(String, Value)> {
        value_entry()
    }

    pub(crate) fn from_preferences(prefs: &Preferences) -> AppResult<Self> {
        Ok(Self::new(
            prefs.require("profile")?,
            prefs.require("property")?,
            prefs.require("value")?,
        ))
    }

    pub(crate) fn write_preferences(&self, prefs: &mut Preferences) {
        prefs.set("profile", &self.profile);
        prefs.set("property", &self.property);
        prefs.set("value", &self.value);
    }

    pub(crate) fn check(&self, scope: &TaskScope, options: &CheckOptions, report: &mut CheckReport) {
        check_property(scope, options, &self.profile, &self.property, true, report);
        match scope.evaluate(&self.value) {
            Ok(value) => {
                if let Err(e) = scope.write("value", value) {
                    report.fail(&scope.full_path(), e.to_string());
                }
            }
            Err(e) => report.fail(&scope.full_path(), e.to_string()),
        }
    }

    pub(crate) fn perform(&self, scope: &TaskScope) -> AppResult<()> {
        let value = scope.evaluate(&self.value)?;
        scope
            .context
            .instruments
            .with_driver(&self.profile, |driver| {
                driver.set_property(&self.property, &value)
            })?;
        info!(
            task = %scope.full_path(),
            profile = %self.profile,
            property = %self.property,
            value = %value,
            "Instrument property set"
        );
        scope.write("value", value)
    }
}
