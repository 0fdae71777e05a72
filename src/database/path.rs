//! Namespace path syntax.
//!
//! Paths are slash-delimited strings rooted at [`ROOT`], e.g.
//! `root/loop/inner`. A full entry path is a node path followed by the value
//! name: `root/loop/print_message`.

use crate::error::{AppResult, DaqError};

/// Name of the fixed namespace root.
pub const ROOT: &str = "root";

/// Segment separator.
pub const SEPARATOR: char = '/';

/// Split and validate a node path.
///
/// The first segment must be [`ROOT`] and no segment may be empty.
pub fn segments(path: &str) -> AppResult<Vec<&str>> {
    let segments: Vec<&str> = path.split(SEPARATOR).collect();
    if segments.first() != Some(&ROOT) {
        return Err(DaqError::InvalidPath(format!(
            "'{}' does not start with '{}'",
            path, ROOT
        )));
    }
    if let Some(bad) = segments.iter().find(|s| s.trim().is_empty()) {
        return Err(DaqError::InvalidPath(format!(
            "'{}' contains an empty segment '{}'",
            path, bad
        )));
    }
    Ok(segments)
}

/// Validate a single node or value name.
pub fn validate_name(name: &str) -> AppResult<()> {
    if name.trim().is_empty() {
        return Err(DaqError::InvalidPath("empty name".to_string()));
    }
    if name.contains(SEPARATOR) {
        return Err(DaqError::InvalidPath(format!(
            "name '{}' must not contain '{}'",
            name, SEPARATOR
        )));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(DaqError::InvalidPath(format!(
            "name '{}' must not contain whitespace",
            name
        )));
    }
    Ok(())
}

/// Append `name` to `path`.
pub fn join(path: &str, name: &str) -> String {
    format!("{}{}{}", path, SEPARATOR, name)
}

/// Split a full entry path into `(node path, value name)`.
pub fn split_entry(full: &str) -> Option<(&str, &str)> {
    full.rsplit_once(SEPARATOR)
}

/// Parent of a node path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    path.rsplit_once(SEPARATOR).map(|(parent, _)| parent)
}

/// Rewrite `path` if it equals or lives under `old_prefix`.
pub fn replace_prefix(path: &str, old_prefix: &str, new_prefix: &str) -> Option<String> {
    if path == old_prefix {
        return Some(new_prefix.to_string());
    }
    path.strip_prefix(old_prefix)
        .filter(|rest| rest.starts_with(SEPARATOR))
        .map(|rest| format!("{}{}", new_prefix, rest))
}
