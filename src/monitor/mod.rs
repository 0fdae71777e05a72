//! Text monitor fed by the namespace.
//!
//! A [`TextMonitor`] keeps one [`MonitoredEntry`] per namespace entry and
//! sorts them into three lists:
//!
//! - **displayed**: shown to the operator
//! - **undisplayed**: rejected by a rule but still tracked
//! - **hidden**: folded into a combined entry by a format rule
//!
//! Entries are added as the namespace grows ([`TextMonitor::handle_event`])
//! and refreshed as values arrive ([`TextMonitor::process_news`]). A news
//! update only touches the entries depending on its path.

pub mod entry;
pub mod rules;

pub use entry::MonitoredEntry;
pub use rules::{MonitorRule, RuleAction, RuleRegistry, FORMAT_RULE, REJECT_RULE};

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::database::{DatabaseEvent, TaskDatabase};
use crate::error::AppResult;
use crate::preferences::Preferences;

/// Monitor shared between the engine and its reader tasks.
pub type MonitorHandle = Arc<Mutex<TextMonitor>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Displayed,
    Undisplayed,
    Hidden,
}

/// Rule-driven view over namespace values.
#[derive(Debug, Default)]
pub struct TextMonitor {
    rules: Vec<MonitorRule>,
    entries: BTreeMap<String, MonitoredEntry>,
    displayed: Vec<String>,
    undisplayed: Vec<String>,
    hidden: Vec<String>,
    /// Namespace path → monitored entries computed from it.
    updaters: HashMap<String, Vec<String>>,
}

impl TextMonitor {
    /// Monitor without rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Monitor applying `rules` in order.
    pub fn with_rules(rules: Vec<MonitorRule>) -> Self {
        Self {
            rules,
            ..Self::default()
        }
    }

    /// Wrap into a [`MonitorHandle`].
    pub fn into_handle(self) -> MonitorHandle {
        Arc::new(Mutex::new(self))
    }

    /// Rules in application order.
    pub fn rules(&self) -> &[MonitorRule] {
        &self.rules
    }

    /// Append a rule and re-sort the tracked entries.
    pub fn add_rule(&mut self, rule: MonitorRule) {
        self.rules.push(rule);
        self.reapply();
    }

    /// Remove the rule called `name` and re-sort the tracked entries.
    pub fn remove_rule(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name != name);
        let removed = self.rules.len() != before;
        if removed {
            self.reapply();
        }
        removed
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Entry by path, whatever its list.
    pub fn entry(&self, path: &str) -> Option<&MonitoredEntry> {
        self.entries.get(path)
    }

    /// Shown entries, in insertion order.
    pub fn displayed_entries(&self) -> Vec<&MonitoredEntry> {
        self.collect(&self.displayed)
    }

    /// Rejected entries.
    pub fn undisplayed_entries(&self) -> Vec<&MonitoredEntry> {
        self.collect(&self.undisplayed)
    }

    /// Entries folded into a combined one.
    pub fn hidden_entries(&self) -> Vec<&MonitoredEntry> {
        self.collect(&self.hidden)
    }

    /// Whether `path` is currently displayed.
    pub fn is_displayed(&self, path: &str) -> bool {
        self.displayed.iter().any(|p| p == path)
    }

    /// Paths of the monitored entries depending on `path`.
    pub fn dependents(&self, path: &str) -> &[String] {
        self.updaters.get(path).map(Vec::as_slice).unwrap_or_default()
    }

    fn collect(&self, paths: &[String]) -> Vec<&MonitoredEntry> {
        paths.iter().filter_map(|p| self.entries.get(p)).collect()
    }

    // =========================================================================
    // Namespace feed
    // =========================================================================

    /// Apply one namespace change.
    pub fn handle_event(&mut self, event: &DatabaseEvent) {
        match event {
            DatabaseEvent::Added { path, value } => self.entry_added(path, Some(value.clone())),
            DatabaseEvent::Updated { path, value } => self.process_news(path, value.clone()),
            DatabaseEvent::Removed { path } => self.entry_removed(path),
            DatabaseEvent::Renamed { old, new } => self.entry_renamed(old, new),
        }
    }

    /// Refresh the entries depending on `path`.
    ///
    /// An unknown path is tracked as a new entry.
    pub fn process_news(&mut self, path: &str, value: Value) {
        if self.entries.contains_key(path) || self.updaters.contains_key(path) {
            self.refresh(path, value);
        } else {
            self.entry_added(path, Some(value));
        }
    }

    /// Track a new namespace entry and run the rules over it.
    ///
    /// A path already held by a combined entry stays with that entry.
    pub fn entry_added(&mut self, path: &str, value: Option<Value>) {
        if self.entries.contains_key(path) {
            if let Some(value) = value {
                self.refresh(path, value);
            }
            return;
        }
        let mut entry = MonitoredEntry::single(path);
        if let Some(value) = value {
            entry.update(path, value);
        }
        self.insert(entry, Bucket::Displayed);
        self.apply_rules(path);
    }

    fn refresh(&mut self, path: &str, value: Value) {
        let Some(dependents) = self.updaters.get(path) else {
            debug!(entry = path, "Namespace entry shadowed by a combined entry");
            return;
        };
        for dependent in dependents {
            if let Some(entry) = self.entries.get_mut(dependent) {
                entry.update(path, value.clone());
            }
        }
    }

    /// Drop a namespace entry and every monitored entry built on it.
    pub fn entry_removed(&mut self, path: &str) {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|entry| entry.depend_on.iter().any(|d| d == path))
            .map(|entry| entry.path.clone())
            .collect();
        for entry_path in doomed {
            self.remove(&entry_path);
        }
        // Contributors of a dropped combined entry become visible again.
        let orphans: Vec<String> = self
            .hidden
            .iter()
            .filter(|hidden| !self.is_contributor(hidden))
            .cloned()
            .collect();
        for orphan in orphans {
            self.move_to(&orphan, Bucket::Displayed);
            self.apply_rules(&orphan);
        }
    }

    /// Follow a renamed namespace entry, keeping its value.
    pub fn entry_renamed(&mut self, old: &str, new: &str) {
        let value = self
            .entries
            .get(old)
            .and_then(|entry| entry.dependency_value(old))
            .cloned();
        self.entry_removed(old);
        self.entry_added(new, value);
    }

    /// Rebuild the monitor from the current content of `database`.
    pub fn refresh_from(&mut self, database: &TaskDatabase) {
        self.clear();
        for (path, value) in database.snapshot() {
            self.entry_added(&path, Some(value));
        }
    }

    /// Forget every entry, keeping the rules.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.displayed.clear();
        self.undisplayed.clear();
        self.hidden.clear();
        self.updaters.clear();
    }

    // =========================================================================
    // Rules
    // =========================================================================

    fn apply_rules(&mut self, path: &str) {
        let rules = self.rules.clone();
        for rule in &rules {
            let Some(prefix) = rule.match_prefix(path) else {
                continue;
            };
            match &rule.action {
                RuleAction::Reject => {
                    debug!(entry = path, rule = %rule.name, "Entry rejected");
                    self.move_to(path, Bucket::Undisplayed);
                    return;
                }
                RuleAction::Format {
                    new_entry_suffix,
                    hide_entries,
                    ..
                } => {
                    let contributors = rule.contributors(prefix);
                    if !contributors.iter().all(|c| self.entries.contains_key(c)) {
                        continue;
                    }
                    let combined_path = format!("{}{}", prefix, new_entry_suffix);
                    if let Some(existing) = self.entries.get(&combined_path) {
                        if existing.depend_on != contributors {
                            debug!(entry = %combined_path, rule = %rule.name, "Combined path already taken");
                            continue;
                        }
                    } else {
                        let Some(formatting) = rule.combined_formatting(prefix) else {
                            continue;
                        };
                        let mut combined =
                            MonitoredEntry::new(&combined_path, &formatting, contributors.clone());
                        for contributor in &contributors {
                            let known = self
                                .entries
                                .get(contributor)
                                .and_then(|e| e.dependency_value(contributor))
                                .cloned();
                            if let Some(value) = known {
                                combined.update(contributor, value);
                            }
                        }
                        debug!(entry = %combined_path, rule = %rule.name, "Combined entry created");
                        self.insert(combined, Bucket::Displayed);
                    }
                    if *hide_entries {
                        for contributor in &contributors {
                            self.move_to(contributor, Bucket::Hidden);
                        }
                    }
                }
            }
        }
    }

    /// Rebuild every list from the plain entries under the current rules.
    fn reapply(&mut self) {
        let values: Vec<(String, Option<Value>)> = self
            .entries
            .values()
            .filter(|entry| entry.depend_on.len() == 1 && entry.depend_on[0] == entry.path)
            .map(|entry| (entry.path.clone(), entry.dependency_value(&entry.path).cloned()))
            .collect();
        self.clear();
        for (path, value) in values {
            self.entry_added(&path, value);
        }
    }

    fn is_contributor(&self, path: &str) -> bool {
        self.entries
            .values()
            .any(|entry| entry.path != path && entry.depend_on.iter().any(|d| d == path))
    }

    // =========================================================================
    // Bookkeeping
    // =========================================================================

    fn insert(&mut self, entry: MonitoredEntry, bucket: Bucket) {
        for dependency in &entry.depend_on {
            self.updaters
                .entry(dependency.clone())
                .or_default()
                .push(entry.path.clone());
        }
        self.bucket_mut(bucket).push(entry.path.clone());
        self.entries.insert(entry.path.clone(), entry);
    }

    fn remove(&mut self, path: &str) {
        self.entries.remove(path);
        for bucket in [Bucket::Displayed, Bucket::Undisplayed, Bucket::Hidden] {
            self.bucket_mut(bucket).retain(|p| p != path);
        }
        self.updaters.retain(|_, dependents| {
            dependents.retain(|p| p != path);
            !dependents.is_empty()
        });
    }

    fn move_to(&mut self, path: &str, target: Bucket) {
        if !self.entries.contains_key(path) {
            return;
        }
        for bucket in [Bucket::Displayed, Bucket::Undisplayed, Bucket::Hidden] {
            self.bucket_mut(bucket).retain(|p| p != path);
        }
        self.bucket_mut(target).push(path.to_string());
    }

    fn bucket_mut(&mut self, bucket: Bucket) -> &mut Vec<String> {
        match bucket {
            Bucket::Displayed => &mut self.displayed,
            Bucket::Undisplayed => &mut self.undisplayed,
            Bucket::Hidden => &mut self.hidden,
        }
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    /// Rules as preferences, under a `rules` section.
    pub fn preferences(&self) -> Preferences {
        let mut rules = Preferences::new();
        rules.set_children(self.rules.iter().map(MonitorRule::preferences).collect());
        Preferences::new().with_section("rules", rules)
    }

    /// Monitor using the rules saved by [`TextMonitor::preferences`].
    pub fn from_preferences(prefs: &Preferences, registry: &RuleRegistry) -> AppResult<Self> {
        let mut rules = Vec::new();
        if let Some(section) = prefs.section("rules") {
            for rule in section.child_sections()? {
                rules.push(registry.build(rule)?);
            }
        }
        Ok(Self::with_rules(rules))
    }
}

/// Seed `monitor` from `database` and keep it in sync with later changes.
pub fn link_monitor(database: &TaskDatabase, monitor: MonitorHandle) {
    monitor.lock().refresh_from(database);
    database.observe(move |event| monitor.lock().handle_event(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn complex_rule(hide: bool) -> MonitorRule {
        MonitorRule::format("complex", &["re", "im"], "cplx", "{re} + {im}j", hide)
    }

    fn paths(entries: Vec<&MonitoredEntry>) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[test]
    fn test_plain_entries_are_displayed() {
        let mut monitor = TextMonitor::new();
        monitor.process_news("root/print_message", json!("x"));
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/print_message"]);
        assert_eq!(monitor.entry("root/print_message").unwrap().value(), "x");
    }

    #[test]
    fn test_reject_rule() {
        let mut monitor = TextMonitor::with_rules(vec![MonitorRule::reject("no_index", &["_index"])]);
        monitor.entry_added("root/loop_index", Some(json!(1)));
        monitor.entry_added("root/loop_value", Some(json!(0.5)));
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/loop_value"]);
        assert_eq!(paths(monitor.undisplayed_entries()), vec!["root/loop_index"]);
        monitor.process_news("root/loop_index", json!(2));
        assert_eq!(monitor.entry("root/loop_index").unwrap().value(), "2");
    }

    #[test]
    fn test_format_rule_combines_entries() {
        let mut monitor = TextMonitor::with_rules(vec![complex_rule(true)]);
        monitor.entry_added("root/a_re", Some(json!(1)));
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/a_re"]);

        monitor.entry_added("root/a_im", Some(json!(2)));
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/a_cplx"]);
        assert_eq!(
            paths(monitor.hidden_entries()),
            vec!["root/a_re", "root/a_im"]
        );
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "1 + 2j");

        monitor.process_news("root/a_im", json!(-3));
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "1 + -3j");
        assert_eq!(monitor.dependents("root/a_re").len(), 2);
    }

    #[test]
    fn test_namespace_entry_on_combined_path() {
        let mut monitor = TextMonitor::with_rules(vec![complex_rule(true)]);
        monitor.entry_added("root/a_re", Some(json!(1)));
        monitor.entry_added("root/a_im", Some(json!(2)));

        monitor.process_news("root/a_cplx", json!("real entry"));
        monitor.entry_added("root/a_cplx", Some(json!("again")));
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "1 + 2j");
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/a_cplx"]);

        monitor.process_news("root/a_re", json!(5));
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "5 + 2j");
    }

    #[test]
    fn test_namespace_entry_keeps_path_taken_first() {
        let mut monitor = TextMonitor::with_rules(vec![complex_rule(true)]);
        monitor.entry_added("root/a_cplx", Some(json!("plain")));
        monitor.entry_added("root/a_re", Some(json!(1)));
        monitor.entry_added("root/a_im", Some(json!(2)));

        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "plain");
        assert!(monitor.hidden_entries().is_empty());
        assert_eq!(
            paths(monitor.displayed_entries()),
            vec!["root/a_cplx", "root/a_re", "root/a_im"]
        );
        monitor.process_news("root/a_cplx", json!("updated"));
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "updated");
    }

    #[test]
    fn test_linked_formula_on_combined_path() {
        let database = TaskDatabase::new();
        let monitor = TextMonitor::with_rules(vec![complex_rule(true)]).into_handle();
        link_monitor(&database, monitor.clone());
        database.set_value("root", "a_re", json!(1)).unwrap();
        database.set_value("root", "a_im", json!(2)).unwrap();
        database.set_value("root", "a_cplx", json!("1+2j")).unwrap();
        database.set_value("root", "a_cplx", json!("3+4j")).unwrap();
        let monitor = monitor.lock();
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "1 + 2j");
    }

    #[test]
    fn test_format_rule_without_hiding() {
        let mut monitor = TextMonitor::with_rules(vec![complex_rule(false)]);
        monitor.entry_added("root/a_re", Some(json!(1)));
        monitor.entry_added("root/a_im", Some(json!(2)));
        assert_eq!(
            paths(monitor.displayed_entries()),
            vec!["root/a_re", "root/a_im", "root/a_cplx"]
        );
    }

    #[test]
    fn test_removing_contributor_drops_combined_entry() {
        let mut monitor = TextMonitor::with_rules(vec![complex_rule(true)]);
        monitor.entry_added("root/a_re", Some(json!(1)));
        monitor.entry_added("root/a_im", Some(json!(2)));
        monitor.entry_removed("root/a_im");
        assert!(monitor.entry("root/a_cplx").is_none());
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/a_re"]);
        assert!(monitor.hidden_entries().is_empty());
    }

    #[test]
    fn test_rename_keeps_value() {
        let mut monitor = TextMonitor::new();
        monitor.entry_added("root/a_message", Some(json!("hi")));
        monitor.handle_event(&DatabaseEvent::Renamed {
            old: "root/a_message".into(),
            new: "root/b_message".into(),
        });
        assert!(monitor.entry("root/a_message").is_none());
        assert_eq!(monitor.entry("root/b_message").unwrap().value(), "hi");
    }

    #[test]
    fn test_added_rule_reapplies() {
        let mut monitor = TextMonitor::new();
        monitor.entry_added("root/a_re", Some(json!(1)));
        monitor.entry_added("root/a_im", Some(json!(2)));
        monitor.add_rule(complex_rule(true));
        assert_eq!(paths(monitor.displayed_entries()), vec!["root/a_cplx"]);
        assert!(monitor.remove_rule("complex"));
        assert_eq!(
            paths(monitor.displayed_entries()),
            vec!["root/a_im", "root/a_re"]
        );
    }

    #[test]
    fn test_linked_monitor_follows_database() {
        let database = TaskDatabase::new();
        database.set_value("root", "a_re", json!(1)).unwrap();
        let monitor = TextMonitor::with_rules(vec![complex_rule(true)]).into_handle();
        link_monitor(&database, monitor.clone());
        database.set_value("root", "a_im", json!(4)).unwrap();
        database.set_value("root", "a_re", json!(3)).unwrap();
        let monitor = monitor.lock();
        assert_eq!(monitor.entry("root/a_cplx").unwrap().value(), "3 + 4j");
    }

    #[test]
    fn test_rules_saved_in_preferences() {
        let monitor = TextMonitor::with_rules(vec![
            MonitorRule::reject("no_index", &["_index"]),
            complex_rule(true),
        ]);
        let restored =
            TextMonitor::from_preferences(&monitor.preferences(), &RuleRegistry::new()).unwrap();
        assert_eq!(restored.rules(), monitor.rules());
    }
}
