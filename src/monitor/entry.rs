use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::eval::{display_value, substitute};

/// One line of a monitor: a formatting template over namespace entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredEntry {
    /// Identifier, the namespace path for a plain entry.
    pub path: String,
    /// Template whose `{path}` placeholders name dependencies.
    pub formatting: String,
    /// Namespace paths this entry is computed from.
    pub depend_on: Vec<String>,
    #[serde(default)]
    values: BTreeMap<String, Value>,
    #[serde(default)]
    value: String,
}

impl MonitoredEntry {
    /// Entry computed from `formatting` over `depend_on`.
    pub fn new(path: &str, formatting: &str, depend_on: Vec<String>) -> Self {
        let mut entry = Self {
            path: path.to_string(),
            formatting: formatting.to_string(),
            depend_on,
            values: BTreeMap::new(),
            value: String::new(),
        };
        entry.recompute();
        entry
    }

    /// Entry displaying a single namespace value.
    pub fn single(path: &str) -> Self {
        Self::new(path, &format!("{{{}}}", path), vec![path.to_string()])
    }

    /// Displayed text.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Last value received for a dependency.
    pub fn dependency_value(&self, dependency: &str) -> Option<&Value> {
        self.values.get(dependency)
    }

    /// Record a new dependency value and refresh the text.
    ///
    /// Returns `false` when `dependency` is not one of this entry's.
    pub fn update(&mut self, dependency: &str, value: Value) -> bool {
        if !self.depend_on.iter().any(|d| d == dependency) {
            return false;
        }
        self.values.insert(dependency.to_string(), value);
        self.recompute();
        true
    }

    fn recompute(&mut self) {
        let values = &self.values;
        self.value = substitute(&self.formatting, |name| {
            Ok(values.get(name).map(display_value).unwrap_or_default())
        })
        .unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_entry_follows_value() {
        let mut entry = MonitoredEntry::single("root/print_message");
        assert_eq!(entry.value(), "");
        assert!(entry.update("root/print_message", json!("x")));
        assert_eq!(entry.value(), "x");
        assert!(!entry.update("root/other", json!(1)));
    }

    #[test]
    fn test_combined_entry() {
        let mut entry = MonitoredEntry::new(
            "root/a_cplx",
            "{root/a_re} + {root/a_im}j",
            vec!["root/a_re".into(), "root/a_im".into()],
        );
        entry.update("root/a_re", json!(1.5));
        entry.update("root/a_im", json!(-2));
        assert_eq!(entry.value(), "1.5 + -2j");
    }
}
