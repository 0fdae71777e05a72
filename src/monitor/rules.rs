//! Monitor rules.
//!
//! A rule watches for entries whose path ends with one of its suffixes:
//!
//! - **Reject** moves the entry out of the displayed list.
//! - **Format** waits until every suffix exists under the same prefix, then
//!   builds one combined entry (e.g. `a_re` and `a_im` into `a_cplx`) and
//!   optionally hides the contributors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

/// What a rule does with a matching entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    /// Stop displaying the entry.
    Reject,
    /// Combine entries sharing a prefix.
    Format {
        /// Suffix of the combined entry.
        new_entry_suffix: String,
        /// Template using the suffixes as placeholders, e.g. `{re} + {im}j`.
        new_entry_formatting: String,
        /// Hide the contributing entries.
        hide_entries: bool,
    },
}

/// A named suffix matcher with its action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorRule {
    /// Rule name.
    pub name: String,
    /// Suffixes, in declared order.
    pub suffixes: Vec<String>,
    /// Action on match.
    pub action: RuleAction,
}

impl MonitorRule {
    /// Rule hiding every entry ending with one of `suffixes`.
    pub fn reject(name: &str, suffixes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
            action: RuleAction::Reject,
        }
    }

    /// Rule combining the entries ending with `suffixes`.
    pub fn format(
        name: &str,
        suffixes: &[&str],
        new_entry_suffix: &str,
        new_entry_formatting: &str,
        hide_entries: bool,
    ) -> Self {
        Self {
            name: name.to_string(),
            suffixes: suffixes.iter().map(|s| s.to_string()).collect(),
            action: RuleAction::Format {
                new_entry_suffix: new_entry_suffix.to_string(),
                new_entry_formatting: new_entry_formatting.to_string(),
                hide_entries,
            },
        }
    }

    /// Prefix left once the first matching suffix is removed from `path`.
    pub fn match_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        self.suffixes
            .iter()
            .find_map(|suffix| path.strip_suffix(suffix.as_str()))
    }

    /// Paths of every contributor sharing `prefix`.
    pub fn contributors(&self, prefix: &str) -> Vec<String> {
        self.suffixes
            .iter()
            .map(|suffix| format!("{}{}", prefix, suffix))
            .collect()
    }

    /// Formatting of the combined entry for `prefix`, with each suffix
    /// placeholder replaced by the full contributor path.
    pub fn combined_formatting(&self, prefix: &str) -> Option<String> {
        let RuleAction::Format {
            new_entry_formatting,
            ..
        } = &self.action
        else {
            return None;
        };
        let mut formatting = new_entry_formatting.clone();
        for suffix in &self.suffixes {
            formatting = formatting.replace(
                &format!("{{{}}}", suffix),
                &format!("{{{}{}}}", prefix, suffix),
            );
        }
        Some(formatting)
    }

    /// Preference map rebuilding this rule.
    pub fn preferences(&self) -> Preferences {
        let mut prefs = Preferences::new()
            .with("name", &self.name)
            .with("suffixes", self.suffixes.join(","));
        match &self.action {
            RuleAction::Reject => prefs.set("rule_type", REJECT_RULE),
            RuleAction::Format {
                new_entry_suffix,
                new_entry_formatting,
                hide_entries,
            } => {
                prefs.set("rule_type", FORMAT_RULE);
                prefs.set("new_entry_suffix", new_entry_suffix);
                prefs.set("new_entry_formatting", new_entry_formatting);
                prefs.set("hide_entries", hide_entries);
            }
        }
        prefs
    }
}

/// `rule_type` of reject rules.
pub const REJECT_RULE: &str = "RejectRule";

/// `rule_type` of format rules.
pub const FORMAT_RULE: &str = "FormatRule";

type RuleBuilder = Box<dyn Fn(&Preferences) -> AppResult<MonitorRule> + Send + Sync>;

/// `rule_type` → rule builder.
pub struct RuleRegistry {
    builders: HashMap<String, RuleBuilder>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&String> = self.builders.keys().collect();
        types.sort();
        f.debug_struct("RuleRegistry").field("rules", &types).finish()
    }
}

fn suffixes(prefs: &Preferences) -> AppResult<Vec<String>> {
    let suffixes: Vec<String> = prefs
        .require("suffixes")?
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if suffixes.is_empty() {
        return Err(DaqError::Build("a rule needs at least one suffix".to_string()));
    }
    Ok(suffixes)
}

impl RuleRegistry {
    /// Registry holding the reject and format rules.
    pub fn new() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register(REJECT_RULE, |prefs| {
            Ok(MonitorRule {
                name: prefs.require("name")?.to_string(),
                suffixes: suffixes(prefs)?,
                action: RuleAction::Reject,
            })
        });
        registry.register(FORMAT_RULE, |prefs| {
            Ok(MonitorRule {
                name: prefs.require("name")?.to_string(),
                suffixes: suffixes(prefs)?,
                action: RuleAction::Format {
                    new_entry_suffix: prefs.require("new_entry_suffix")?.to_string(),
                    new_entry_formatting: prefs.require("new_entry_formatting")?.to_string(),
                    hide_entries: prefs.parse_or("hide_entries", true)?,
                },
            })
        });
        registry
    }

    /// Add or replace a rule type.
    pub fn register<F>(&mut self, rule_type: &str, builder: F)
    where
        F: Fn(&Preferences) -> AppResult<MonitorRule> + Send + Sync + 'static,
    {
        self.builders.insert(rule_type.to_string(), Box::new(builder));
    }

    /// Rebuild a rule from preferences.
    pub fn build(&self, prefs: &Preferences) -> AppResult<MonitorRule> {
        let rule_type = prefs.require("rule_type")?;
        self.builders
            .get(rule_type)
            .ok_or_else(|| DaqError::Build(format!("unknown rule type '{}'", rule_type)))
            .and_then(|builder| builder(prefs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_prefix() {
        let rule = MonitorRule::format("complex", &["re", "im"], "cplx", "{re} + {im}j", true);
        assert_eq!(rule.match_prefix("root/a_re"), Some("root/a_"));
        assert_eq!(rule.match_prefix("root/a_im"), Some("root/a_"));
        assert_eq!(rule.match_prefix("root/a_abs"), None);
        assert_eq!(
            rule.contributors("root/a_"),
            vec!["root/a_re".to_string(), "root/a_im".to_string()]
        );
        assert_eq!(
            rule.combined_formatting("root/a_").unwrap(),
            "{root/a_re} + {root/a_im}j"
        );
    }

    #[test]
    fn test_rules_survive_preferences() {
        let registry = RuleRegistry::new();
        for rule in [
            MonitorRule::reject("no_index", &["_index"]),
            MonitorRule::format("complex", &["re", "im"], "cplx", "{re} + {im}j", false),
        ] {
            assert_eq!(registry.build(&rule.preferences()).unwrap(), rule);
        }
    }

    #[test]
    fn test_unknown_rule_type() {
        let prefs = Preferences::new().with("rule_type", "Sparkle").with("name", "x");
        assert!(matches!(RuleRegistry::new().build(&prefs), Err(DaqError::Build(_))));
    }
}
