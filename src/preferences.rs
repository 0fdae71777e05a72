//! Preference maps and task templates.
//!
//! A task tree is persisted as nested sections of string-valued keys. Each
//! task writes its own fields plus a `task_id` naming its type; children are
//! stored in sections called `children_0`, `children_1`, ... in declared
//! order.
//!
//! Templates are TOML files whose leading `#` comment block documents the
//! protocol:
//!
//! ```text
//! # Sweep the source voltage and read it back.
//! task_id = "Root"
//! name = "root"
//!
//! [children_0]
//! task_id = "Print"
//! name = "print"
//! message = "hello"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{AppResult, DaqError};

/// Prefix used for the sections holding child tasks.
pub const CHILD_SECTION_PREFIX: &str = "children_";

/// One key of a preference map: a plain string or a nested section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrefValue {
    /// A single string value.
    Value(String),
    /// A nested section.
    Section(Preferences),
}

/// Nested map of string values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Preferences {
    entries: BTreeMap<String, PrefValue>,
}

impl Preferences {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style string insertion.
    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    /// Builder-style section insertion.
    pub fn with_section(mut self, key: &str, section: Preferences) -> Self {
        self.set_section(key, section);
        self
    }

    /// Insert a string value.
    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.entries
            .insert(key.to_string(), PrefValue::Value(value.to_string()));
    }

    /// Insert a nested section.
    pub fn set_section(&mut self, key: &str, section: Preferences) {
        self.entries
            .insert(key.to_string(), PrefValue::Section(section));
    }

    /// String value stored under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&str> {
        match self.entries.get(key) {
            Some(PrefValue::Value(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// String value stored under `key`, or a [`DaqError::Build`] error.
    pub fn require(&self, key: &str) -> AppResult<&str> {
        self.get(key).ok_or_else(|| {
            DaqError::Build(format!(
                "missing field '{}' in section '{}'",
                key,
                self.get("name").unwrap_or("<unnamed>")
            ))
        })
    }

    /// Parse the value under `key`, falling back to `default` when absent.
    pub fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> AppResult<T> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| {
                DaqError::Build(format!("field '{}' has an invalid value '{}'", key, raw))
            }),
        }
    }

    /// Nested section stored under `key`, if any.
    pub fn section(&self, key: &str) -> Option<&Preferences> {
        match self.entries.get(key) {
            Some(PrefValue::Section(s)) => Some(s),
            _ => None,
        }
    }

    /// String values of this section (nested sections skipped).
    pub fn values(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|(k, v)| match v {
            PrefValue::Value(v) => Some((k.as_str(), v.as_str())),
            PrefValue::Section(_) => None,
        })
    }

    /// Child task sections ordered by their index.
    pub fn child_sections(&self) -> AppResult<Vec<&Preferences>> {
        let mut indexed = Vec::new();
        for (key, value) in &self.entries {
            let Some(index) = key.strip_prefix(CHILD_SECTION_PREFIX) else {
                continue;
            };
            let index: usize = index
                .parse()
                .map_err(|_| DaqError::Build(format!("invalid child section '{}'", key)))?;
            match value {
                PrefValue::Section(section) => indexed.push((index, section)),
                PrefValue::Value(_) => {
                    return Err(DaqError::Build(format!("'{}' is not a section", key)))
                }
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, section)| section).collect())
    }

    /// Store `children` as `children_<i>` sections.
    pub fn set_children(&mut self, children: Vec<Preferences>) {
        self.entries
            .retain(|key, _| !key.starts_with(CHILD_SECTION_PREFIX));
        for (index, child) in children.into_iter().enumerate() {
            self.set_section(&format!("{}{}", CHILD_SECTION_PREFIX, index), child);
        }
    }

    /// True when no key is present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// =============================================================================
// Templates
// =============================================================================

/// A saved task tree together with its documentation block.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    /// Free text found in the leading comment block.
    pub doc: String,
    /// The task tree.
    pub preferences: Preferences,
}

impl Template {
    /// Parse template text.
    pub fn parse(text: &str) -> AppResult<Self> {
        let doc = text
            .lines()
            .take_while(|line| line.trim_start().starts_with('#'))
            .map(|line| {
                let line = line.trim_start().trim_start_matches('#');
                line.strip_prefix(' ').unwrap_or(line)
            })
            .collect::<Vec<_>>()
            .join("\n");
        let preferences: Preferences = toml::from_str(text)?;
        Ok(Self { doc, preferences })
    }

    /// Render template text.
    pub fn render(&self) -> AppResult<String> {
        let mut out = String::new();
        for line in self.doc.lines() {
            out.push_str("# ");
            out.push_str(line);
            out.push('\n');
        }
        if !self.doc.is_empty() {
            out.push('\n');
        }
        out.push_str(&toml::to_string(&self.preferences)?);
        Ok(out)
    }
}

/// Load a template file.
pub fn load_template(path: &Path) -> AppResult<Template> {
    let text = fs::read_to_string(path)?;
    Template::parse(&text)
}

/// Save `preferences` to `path`, prefixed with `doc` as a comment block.
pub fn save_template(path: &Path, preferences: &Preferences, doc: &str) -> AppResult<()> {
    let template = Template {
        doc: doc.to_string(),
        preferences: preferences.clone(),
    };
    fs::write(path, template.render()?)?;
    Ok(())
}
