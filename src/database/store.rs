//! Hierarchical task database.
//!
//! Every task writes its results into a shared tree of named nodes. Each node
//! holds sub-nodes and value entries in two separate maps; a name used by one
//! kind can never be reused by the other inside the same node.
//!
//! Lookups walk up the tree: an entry written at `root` is visible from
//! `root/loop/inner`, which is how a deeply nested task reads values produced
//! by its ancestors and their siblings.
//!
//! # Change listeners
//!
//! Observers registered through [`TaskDatabase::observe`] receive a
//! [`DatabaseEvent`] after each mutation. Events are collected while the lock
//! is held and dispatched once it is released, so a listener may read the
//! database again.

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::path::{self, ROOT};
use crate::error::{AppResult, DaqError};

/// A single mutation of the database, addressed by full entry path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DatabaseEvent {
    /// A new entry was created.
    Added { path: String, value: Value },
    /// An existing entry received a new value.
    Updated { path: String, value: Value },
    /// An entry disappeared (directly or with its node).
    Removed { path: String },
    /// An entry moved, keeping its value.
    Renamed { old: String, new: String },
}

/// Callback invoked after each database mutation.
pub type DatabaseListener = Arc<dyn Fn(&DatabaseEvent) + Send + Sync>;

#[derive(Debug, Default, Clone)]
struct DatabaseNode {
    nodes: BTreeMap<String, DatabaseNode>,
    values: BTreeMap<String, Value>,
}

impl DatabaseNode {
    fn descend(&self, segments: &[&str]) -> Option<&DatabaseNode> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.nodes.get(*segment))
    }

    fn descend_mut(&mut self, segments: &[&str]) -> Option<&mut DatabaseNode> {
        segments
            .iter()
            .try_fold(self, |node, segment| node.nodes.get_mut(*segment))
    }

    /// Full paths of every value below this node, which lives at `prefix`.
    fn collect_entries(&self, prefix: &str, out: &mut Vec<(String, Value)>) {
        for (name, value) in &self.values {
            out.push((path::join(prefix, name), value.clone()));
        }
        for (name, node) in &self.nodes {
            node.collect_entries(&path::join(prefix, name), out);
        }
    }
}

/// Shared, path-keyed store of task results.
pub struct TaskDatabase {
    /// Tree below `root`; the root node itself is this value.
    root: Mutex<DatabaseNode>,
    listeners: RwLock<Vec<DatabaseListener>>,
    running: AtomicBool,
}

impl std::fmt::Debug for TaskDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDatabase")
            .field("entries", &self.list_all_entries().len())
            .field("listeners", &self.listeners.read().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Default for TaskDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskDatabase {
    /// Create a database holding only the empty `root` node.
    pub fn new() -> Self {
        Self {
            root: Mutex::new(DatabaseNode::default()),
            listeners: RwLock::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Register a change listener.
    pub fn observe<F>(&self, listener: F)
    where
        F: Fn(&DatabaseEvent) + Send + Sync + 'static,
    {
        self.listeners.write().push(Arc::new(listener));
    }

    /// Mark the beginning of a run.
    pub fn prepare_for_running(&self) {
        self.running.store(true, Ordering::SeqCst);
        debug!("Task database entering running mode");
    }

    /// Mark the end of a run.
    pub fn finish_running(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Whether a run is currently in progress.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Value operations
    // =========================================================================

    /// Create or overwrite `name` in the node at `node_path`.
    ///
    /// Returns `true` if the entry did not exist before.
    pub fn set_value(&self, node_path: &str, name: &str, value: Value) -> AppResult<bool> {
        let segments = path::segments(node_path)?;
        path::validate_name(name)?;
        let full = path::join(node_path, name);

        let event = {
            let mut root = self.root.lock();
            let node = root
                .descend_mut(&segments[1..])
                .ok_or_else(|| DaqError::InvalidPath(format!("no node at '{}'", node_path)))?;
            if node.nodes.contains_key(name) {
                return Err(DaqError::NameCollision {
                    path: node_path.to_string(),
                    name: name.to_string(),
                });
            }
            match node.values.insert(name.to_string(), value.clone()) {
                None => DatabaseEvent::Added { path: full, value },
                Some(_) => DatabaseEvent::Updated { path: full, value },
            }
        };

        let is_new = matches!(event, DatabaseEvent::Added { .. });
        self.notify(&[event]);
        Ok(is_new)
    }

    /// Look `name` up starting at `node_path` and walking towards the root.
    pub fn get_value(&self, node_path: &str, name: &str) -> AppResult<Value> {
        let segments = path::segments(node_path)?;
        let root = self.root.lock();
        for depth in (1..=segments.len()).rev() {
            let found = root
                .descend(&segments[1..depth])
                .and_then(|node| node.values.get(name));
            if let Some(value) = found {
                return Ok(value.clone());
            }
        }
        Err(DaqError::not_found(node_path, name))
    }

    /// Remove `name` from the node at `node_path`.
    pub fn delete_value(&self, node_path: &str, name: &str) -> AppResult<()> {
        let segments = path::segments(node_path)?;
        {
            let mut root = self.root.lock();
            root.descend_mut(&segments[1..])
                .and_then(|node| node.values.remove(name))
                .ok_or_else(|| DaqError::not_found(node_path, name))?;
        }
        self.notify(&[DatabaseEvent::Removed {
            path: path::join(node_path, name),
        }]);
        Ok(())
    }

    /// Rename a value in place, keeping what it holds.
    pub fn rename_value(&self, node_path: &str, old: &str, new: &str) -> AppResult<()> {
        let segments = path::segments(node_path)?;
        path::validate_name(new)?;
        {
            let mut root = self.root.lock();
            let node = root
                .descend_mut(&segments[1..])
                .ok_or_else(|| DaqError::not_found(node_path, old))?;
            if node.nodes.contains_key(new) || node.values.contains_key(new) {
                return Err(DaqError::NameCollision {
                    path: node_path.to_string(),
                    name: new.to_string(),
                });
            }
            let value = node
                .values
                .remove(old)
                .ok_or_else(|| DaqError::not_found(node_path, old))?;
            node.values.insert(new.to_string(), value);
        }
        self.notify(&[DatabaseEvent::Renamed {
            old: path::join(node_path, old),
            new: path::join(node_path, new),
        }]);
        Ok(())
    }

    // =========================================================================
    // Structural operations
    // =========================================================================

    /// Create an empty sub-node. Creating an existing node is a no-op.
    pub fn create_node(&self, parent_path: &str, name: &str) -> AppResult<()> {
        let segments = path::segments(parent_path)?;
        path::validate_name(name)?;
        let mut root = self.root.lock();
        let parent = root
            .descend_mut(&segments[1..])
            .ok_or_else(|| DaqError::InvalidPath(format!("no node at '{}'", parent_path)))?;
        if parent.values.contains_key(name) {
            return Err(DaqError::NameCollision {
                path: parent_path.to_string(),
                name: name.to_string(),
            });
        }
        parent.nodes.entry(name.to_string()).or_default();
        Ok(())
    }

    /// Rename the sub-node `old_name` of `parent_path` to `new_name`.
    pub fn rename_node(&self, parent_path: &str, new_name: &str, old_name: &str) -> AppResult<()> {
        let segments = path::segments(parent_path)?;
        path::validate_name(new_name)?;
        let old_prefix = path::join(parent_path, old_name);
        let new_prefix = path::join(parent_path, new_name);

        let events = {
            let mut root = self.root.lock();
            let parent = root
                .descend_mut(&segments[1..])
                .ok_or_else(|| DaqError::InvalidPath(format!("no node at '{}'", parent_path)))?;
            if parent.nodes.contains_key(new_name) || parent.values.contains_key(new_name) {
                return Err(DaqError::NameCollision {
                    path: parent_path.to_string(),
                    name: new_name.to_string(),
                });
            }
            let node = parent
                .nodes
                .remove(old_name)
                .ok_or_else(|| DaqError::InvalidPath(format!("no node at '{}'", old_prefix)))?;

            let mut entries = Vec::new();
            node.collect_entries(&old_prefix, &mut entries);
            parent.nodes.insert(new_name.to_string(), node);

            entries
                .into_iter()
                .filter_map(|(old, _)| {
                    path::replace_prefix(&old, &old_prefix, &new_prefix)
                        .map(|new| DatabaseEvent::Renamed { old, new })
                })
                .collect::<Vec<_>>()
        };

        self.notify(&events);
        Ok(())
    }

    /// Delete a sub-node together with everything below it.
    pub fn delete_node(&self, parent_path: &str, name: &str) -> AppResult<()> {
        let segments = path::segments(parent_path)?;
        let node_path = path::join(parent_path, name);
        let events = {
            let mut root = self.root.lock();
            let node = root
                .descend_mut(&segments[1..])
                .and_then(|parent| parent.nodes.remove(name))
                .ok_or_else(|| DaqError::InvalidPath(format!("no node at '{}'", node_path)))?;
            let mut entries = Vec::new();
            node.collect_entries(&node_path, &mut entries);
            entries
                .into_iter()
                .map(|(path, _)| DatabaseEvent::Removed { path })
                .collect::<Vec<_>>()
        };
        self.notify(&events);
        Ok(())
    }

    // =========================================================================
    // Listing
    // =========================================================================

    /// Every value name visible from `node_path` up to the root, sorted.
    pub fn list_accessible_entries(&self, node_path: &str) -> AppResult<Vec<String>> {
        let segments = path::segments(node_path)?;
        let root = self.root.lock();
        let mut names: Vec<String> = (1..=segments.len())
            .filter_map(|depth| root.descend(&segments[1..depth]))
            .flat_map(|node| node.values.keys().cloned())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Full path of every entry in the database.
    pub fn list_all_entries(&self) -> Vec<String> {
        self.snapshot().into_keys().collect()
    }

    /// Copy of every entry, keyed by full path.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut entries = Vec::new();
        self.root.lock().collect_entries(ROOT, &mut entries);
        entries.into_iter().collect()
    }

    /// Whether a node exists at `node_path`.
    pub fn has_node(&self, node_path: &str) -> bool {
        path::segments(node_path)
            .ok()
            .map(|segments| self.root.lock().descend(&segments[1..]).is_some())
            .unwrap_or(false)
    }

    fn notify(&self, events: &[DatabaseEvent]) {
        if events.is_empty() {
            return;
        }
        let listeners = self.listeners.read().clone();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}
