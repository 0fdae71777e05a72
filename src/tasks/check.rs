use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Options controlling how far a check goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOptions {
    /// Open every instrument connection referenced by the tree.
    #[serde(default)]
    pub test_instruments: bool,
}

/// Failures found by a check, keyed by the task's full path.
///
/// A check never returns an error: every failure of the tree is collected so
/// that the user can fix them all at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    failures: BTreeMap<String, Vec<String>>,
}

impl CheckReport {
    /// Empty, successful report.
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no failure was recorded.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    /// Record a failure for the task at `task`.
    pub fn fail(&mut self, task: &str, message: impl Into<String>) {
        self.failures
            .entry(task.to_string())
            .or_default()
            .push(message.into());
    }

    /// Absorb the failures of another report.
    pub fn merge(&mut self, other: CheckReport) {
        for (task, messages) in other.failures {
            self.failures.entry(task).or_default().extend(messages);
        }
    }

    /// Failures by task path.
    pub fn failures(&self) -> &BTreeMap<String, Vec<String>> {
        &self.failures
    }

    /// Messages recorded for one task.
    pub fn failures_of(&self, task: &str) -> &[String] {
        self.failures.get(task).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl fmt::Display for CheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return write!(f, "check passed");
        }
        for (task, messages) in &self.failures {
            for message in messages {
                writeln!(f, "{}: {}", task, message)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_keeps_every_failure() {
        let mut a = CheckReport::new();
        a.fail("root/sleep", "bad time");
        let mut b = CheckReport::new();
        b.fail("root/sleep", "negative");
        b.fail("root/print", "missing entry");
        a.merge(b);

        assert!(!a.is_ok());
        assert_eq!(a.failures_of("root/sleep").len(), 2);
        assert_eq!(a.failures().len(), 2);
        assert!(a.to_string().contains("root/print: missing entry"));
    }
}
