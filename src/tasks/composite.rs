use std::sync::Arc;
use tracing::warn;

use super::check::{CheckOptions, CheckReport};
use super::node::{RootContext, TaskNode};
use crate::database::path::{self, ROOT};
use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

/// Ordered children, the only place where the tree is traversed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositeTask {
    children: Vec<TaskNode>,
}

impl CompositeTask {
    /// Empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Composite over detached children.
    pub fn with_children(children: Vec<TaskNode>) -> AppResult<Self> {
        let mut composite = Self::new();
        for child in children {
            composite.insert(composite.children.len(), child, ROOT, 1, None)?;
        }
        Ok(composite)
    }

    /// Children in declared order.
    pub fn children(&self) -> &[TaskNode] {
        &self.children
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True when there is no child.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Attach `child` at `index`.
    ///
    /// The whole subtree of `child` is moved below `children_path` before it
    /// registers its entries.
    pub(crate) fn insert(
        &mut self,
        index: usize,
        mut child: TaskNode,
        children_path: &str,
        depth: usize,
        context: Option<Arc<RootContext>>,
    ) -> AppResult<()> {
        path::validate_name(child.name())?;
        if index > self.children.len() {
            return Err(DaqError::Build(format!(
                "cannot insert at {} in '{}' holding {} tasks",
                index,
                children_path,
                self.children.len()
            )));
        }
        self.ensure_unique(child.name())?;
        child.relocate(children_path, depth, context);
        if let Err(e) = child.register_in_database() {
            // Leave nothing behind from a partial registration.
            if let Err(cleanup) = child.unregister_from_database() {
                warn!(task = %child.full_path(), error = %cleanup, "Partial registration left behind");
            }
            return Err(e);
        }
        self.children.insert(index, child);
        Ok(())
    }

    /// Detach and return the child at `index`.
    pub(crate) fn remove(&mut self, index: usize) -> AppResult<TaskNode> {
        if index >= self.children.len() {
            return Err(DaqError::Build(format!("no task at index {}", index)));
        }
        let mut child = self.children.remove(index);
        child.unregister_from_database()?;
        child.relocate(ROOT, 0, None);
        Ok(child)
    }

    /// Rename the child at `index`.
    pub(crate) fn rename(&mut self, index: usize, new_name: &str) -> AppResult<()> {
        let current = self
            .children
            .get(index)
            .map(|c| c.name().to_string())
            .ok_or_else(|| DaqError::Build(format!("no task at index {}", index)))?;
        if current != new_name {
            self.ensure_unique(new_name)?;
        }
        self.children[index].rename(new_name)
    }

    /// Move a child inside the list.
    pub fn move_child(&mut self, from: usize, to: usize) -> AppResult<()> {
        if from >= self.children.len() || to >= self.children.len() {
            return Err(DaqError::Build(format!("cannot move task {} to {}", from, to)));
        }
        let child = self.children.remove(from);
        self.children.insert(to, child);
        Ok(())
    }

    /// Descendant whose full path is `full_path`.
    pub(crate) fn find_mut(&mut self, full_path: &str) -> Option<&mut TaskNode> {
        for child in &mut self.children {
            if child.full_path() == full_path {
                return Some(child);
            }
            let prefix = child.full_path();
            if full_path.starts_with(&prefix) {
                if let Some(found) = child.find_mut(full_path) {
                    return Some(found);
                }
            }
        }
        None
    }

    fn ensure_unique(&self, name: &str) -> AppResult<()> {
        if self.children.iter().any(|c| c.name() == name) {
            return Err(DaqError::Build(format!("a sibling task is already named '{}'", name)));
        }
        Ok(())
    }

    pub(crate) fn relocate(
        &mut self,
        children_path: &str,
        depth: usize,
        context: Option<Arc<RootContext>>,
    ) {
        for child in &mut self.children {
            child.relocate(children_path, depth, context.clone());
        }
    }

    pub(crate) fn register_in_database(&self) -> AppResult<()> {
        self.children
            .iter()
            .try_for_each(TaskNode::register_in_database)
    }

    pub(crate) fn unregister_from_database(&self) -> AppResult<()> {
        self.children
            .iter()
            .try_for_each(TaskNode::unregister_from_database)
    }

    /// Check every child; the result is ok only if all are.
    pub fn check(&self, options: &CheckOptions) -> CheckReport {
        let mut report = CheckReport::new();
        for child in &self.children {
            report.merge(child.check(options));
        }
        report
    }

    /// Perform the children sequentially in declared order.
    pub fn perform(&self) -> AppResult<()> {
        self.children.iter().try_for_each(TaskNode::perform)
    }

    pub(crate) fn children_preferences(&self) -> Vec<Preferences> {
        self.children.iter().map(TaskNode::preferences).collect()
    }
}
