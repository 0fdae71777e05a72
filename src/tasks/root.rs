//! Root of a protocol tree.
//!
//! The root owns the [`RootContext`] (namespace, stop flag, pending threads,
//! instruments) and hands it to every task attached below it. Its children
//! write their entries directly in the `root` namespace node.

use std::sync::Arc;
use tracing::{info, warn};

use super::check::{CheckOptions, CheckReport};
use super::composite::CompositeTask;
use super::node::{RootContext, TaskNode};
use crate::contracts::{StopFlag, WaitTarget};
use crate::database::path::{self, ROOT};
use crate::database::TaskDatabase;
use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

/// `task_id` written for the root section.
pub const ROOT_TASK_ID: &str = "Root";

/// Creates a new task on behalf of the root, typically by asking the user.
pub trait ChildRequester: Send + Sync {
    /// A new detached task to insert below `parent_path`, if any.
    fn request_child(&self, parent_path: &str) -> Option<TaskNode>;
}

/// Top of a protocol tree.
pub struct RootTask {
    children: CompositeTask,
    context: Arc<RootContext>,
    requester: Option<Arc<dyn ChildRequester>>,
}

impl std::fmt::Debug for RootTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootTask")
            .field("children", &self.children.len())
            .field("context", &self.context)
            .finish()
    }
}

impl Default for RootTask {
    fn default() -> Self {
        Self::new(Arc::new(RootContext::default()))
    }
}

impl RootTask {
    /// Empty root over `context`.
    pub fn new(context: Arc<RootContext>) -> Self {
        Self {
            children: CompositeTask::new(),
            context,
            requester: None,
        }
    }

    /// Install the hook used by [`RootTask::request_child`].
    pub fn with_requester(mut self, requester: Arc<dyn ChildRequester>) -> Self {
        self.requester = Some(requester);
        self
    }

    /// Shared run-time context.
    pub fn context(&self) -> &Arc<RootContext> {
        &self.context
    }

    /// Namespace of the tree.
    pub fn database(&self) -> &Arc<TaskDatabase> {
        &self.context.database
    }

    /// Cooperative stop flag of the tree.
    pub fn stop_flag(&self) -> &StopFlag {
        self.context.stop_flag()
    }

    /// Direct children.
    pub fn children(&self) -> &[TaskNode] {
        self.children.children()
    }

    /// Ask the installed [`ChildRequester`] for a new task.
    pub fn request_child(&self, parent_path: &str) -> Option<TaskNode> {
        self.requester
            .as_ref()
            .and_then(|requester| requester.request_child(parent_path))
    }

    // =========================================================================
    // Editing
    // =========================================================================

    /// Append a direct child.
    pub fn push_child(&mut self, child: TaskNode) -> AppResult<()> {
        let index = self.children.len();
        self.add_child(ROOT, index, child)
    }

    /// Insert `child` at `index` in the composite whose full path is
    /// `parent` (`root` for the root itself).
    pub fn add_child(&mut self, parent: &str, index: usize, child: TaskNode) -> AppResult<()> {
        if parent == ROOT {
            let context = Some(self.context.clone());
            return self.children.insert(index, child, ROOT, 1, context);
        }
        self.task_mut(parent)?.add_child(index, child)
    }

    /// Detach the task whose full path is `task` and return it.
    pub fn remove_task(&mut self, task: &str) -> AppResult<TaskNode> {
        let (parent, name) = path::split_entry(task)
            .ok_or_else(|| DaqError::InvalidPath(format!("'{}' is not a task path", task)))?;
        let parent = parent.to_string();
        let index = self.child_index(&parent, name)?;
        if parent == ROOT {
            return self.children.remove(index);
        }
        self.task_mut(&parent)?.remove_child(index)
    }

    /// Rename the task whose full path is `task`.
    pub fn rename_task(&mut self, task: &str, new_name: &str) -> AppResult<()> {
        let (parent, name) = path::split_entry(task)
            .ok_or_else(|| DaqError::InvalidPath(format!("'{}' is not a task path", task)))?;
        let parent = parent.to_string();
        let index = self.child_index(&parent, name)?;
        if parent == ROOT {
            return self.children.rename(index, new_name);
        }
        self.task_mut(&parent)?.rename_child(index, new_name)
    }

    /// Task whose full path is `task`.
    pub fn task_mut(&mut self, task: &str) -> AppResult<&mut TaskNode> {
        self.children
            .find_mut(task)
            .ok_or_else(|| DaqError::InvalidPath(format!("no task at '{}'", task)))
    }

    fn child_index(&mut self, parent: &str, name: &str) -> AppResult<usize> {
        let siblings = if parent == ROOT {
            self.children.children()
        } else {
            self.task_mut(parent)?.children()
        };
        siblings
            .iter()
            .position(|c| c.name() == name)
            .ok_or_else(|| DaqError::InvalidPath(format!("no task named '{}' in '{}'", name, parent)))
    }

    // =========================================================================
    // Check and run
    // =========================================================================

    /// Check every task of the tree.
    pub fn check(&self, options: &CheckOptions) -> CheckReport {
        let report = self.children.check(options);
        if !report.is_ok() {
            warn!(failures = report.failures().len(), "Check failed");
        }
        report
    }

    /// Run the whole tree.
    ///
    /// Parallel threads still pending at the end are joined and every
    /// instrument connection is closed, whatever the outcome.
    pub fn perform(&self) -> AppResult<()> {
        let context = &self.context;
        context.control.failures.clear();
        context.database.prepare_for_running();
        info!(tasks = self.children.len(), "Protocol started");

        let result = self.children.perform();
        let joined = context.control.pending.wait(&WaitTarget::All);

        context.instruments.close_all();
        context.database.finish_running();
        result.and(joined)
    }

    /// Preference map of the whole tree.
    pub fn preferences(&self) -> Preferences {
        let mut prefs = Preferences::new()
            .with("task_id", ROOT_TASK_ID)
            .with("name", ROOT);
        prefs.set_children(self.children.children_preferences());
        prefs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ExecutionPlan, DEFAULT_POOL};
    use crate::tasks::leaves::{PrintTask, SleepTask};
    use crate::tasks::node::TaskKind;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn print(name: &str, message: &str) -> TaskNode {
        TaskNode::new(name, TaskKind::Print(PrintTask::new(message)))
    }

    fn composite(name: &str) -> TaskNode {
        TaskNode::new(name, TaskKind::Composite(CompositeTask::new()))
    }

    fn entry_set(root: &RootTask) -> BTreeSet<String> {
        root.database().list_all_entries().into_iter().collect()
    }

    #[test]
    fn test_attach_sets_location() {
        let mut root = RootTask::default();
        root.push_child(composite("outer")).unwrap();
        root.add_child("root/outer", 0, composite("inner")).unwrap();
        root.add_child("root/outer/inner", 0, print("print", "x"))
            .unwrap();

        let outer = &root.children()[0];
        assert_eq!((outer.path(), outer.depth()), ("root", 1));
        let inner = &outer.children()[0];
        assert_eq!((inner.path(), inner.depth()), ("root/outer", 2));
        let leaf = &inner.children()[0];
        assert_eq!((leaf.path(), leaf.depth()), ("root/outer/inner", 3));
        assert!(root.database().has_node("root/outer/inner"));
        assert_eq!(
            entry_set(&root),
            BTreeSet::from(["root/outer/inner/print_message".to_string()])
        );
    }

    #[test]
    fn test_register_unregister_round_trip() {
        let mut root = RootTask::default();
        root.push_child(print("first", "a")).unwrap();
        let before = entry_set(&root);

        let mut subtree = composite("block");
        subtree.add_child(0, print("p", "x")).unwrap();
        subtree.add_child(1, composite("nested")).unwrap();
        root.push_child(subtree).unwrap();
        assert_ne!(entry_set(&root), before);

        let removed = root.remove_task("root/block").unwrap();
        assert_eq!(entry_set(&root), before);
        assert!(!removed.is_attached());
        assert!(!root.database().has_node("root/block"));
        assert_eq!(removed.children()[0].path(), "root/block");
    }

    #[test]
    fn test_rename_composite_rewrites_paths() {
        let mut root = RootTask::default();
        root.push_child(composite("outer")).unwrap();
        root.add_child("root/outer", 0, print("p", "x")).unwrap();
        root.database()
            .set_value("root/outer", "p_message", json!("kept"))
            .unwrap();

        root.rename_task("root/outer", "renamed").unwrap();

        let leaf = &root.children()[0].children()[0];
        assert_eq!(leaf.path(), "root/renamed");
        assert_eq!(
            root.database().get_value("root/renamed", "p_message").unwrap(),
            json!("kept")
        );
        assert!(!root.database().has_node("root/outer"));
    }

    #[test]
    fn test_rename_leaf_moves_entries() {
        let mut root = RootTask::default();
        root.push_child(print("p", "x")).unwrap();
        root.rename_task("root/p", "q").unwrap();
        assert_eq!(
            entry_set(&root),
            BTreeSet::from(["root/q_message".to_string()])
        );
    }

    #[test]
    fn test_sibling_names_are_unique() {
        let mut root = RootTask::default();
        root.push_child(print("p", "x")).unwrap();
        root.push_child(print("q", "y")).unwrap();
        assert!(matches!(root.push_child(print("p", "z")), Err(DaqError::Build(_))));
        assert!(matches!(root.rename_task("root/q", "p"), Err(DaqError::Build(_))));
    }

    #[test]
    fn test_stop_flag_suppresses_writes() {
        let mut root = RootTask::default();
        root.push_child(print("p", "x")).unwrap();
        let written = Arc::new(parking_lot::Mutex::new(0));
        let counter = written.clone();
        root.database().observe(move |_| *counter.lock() += 1);

        root.stop_flag().set();
        root.perform().unwrap();
        assert_eq!(*written.lock(), 0);
        assert_eq!(
            root.database().get_value("root", "p_message").unwrap(),
            json!("")
        );
    }

    #[test]
    fn test_perform_sequence() {
        let mut root = RootTask::default();
        root.push_child(print("greet", "hello")).unwrap();
        root.push_child(print("echo", "{greet_message} again"))
            .unwrap();
        assert!(root.check(&CheckOptions::default()).is_ok());
        root.perform().unwrap();
        assert_eq!(
            root.database().get_value("root", "echo_message").unwrap(),
            json!("hello again")
        );
    }

    #[test]
    fn test_wait_runs_after_parallel_siblings() {
        let mut root = RootTask::default();
        let parallel = ExecutionPlan::from_options(Some(DEFAULT_POOL.into()), None, false).unwrap();
        let waiting = ExecutionPlan::from_options(None, Some(WaitTarget::All), false).unwrap();

        root.push_child(
            TaskNode::new("slow", TaskKind::Sleep(SleepTask::new("0.2"))).with_plan(parallel.clone()),
        )
        .unwrap();
        root.push_child(
            TaskNode::new(
                "mark",
                TaskKind::Print(PrintTask::new("done")),
            )
            .with_plan(parallel),
        )
        .unwrap();
        root.push_child(print("after", "{mark_message}").with_plan(waiting))
            .unwrap();

        let start = std::time::Instant::now();
        root.perform().unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(200));
        assert_eq!(
            root.database().get_value("root", "after_message").unwrap(),
            json!("done")
        );
        assert!(root.context().control.pending.is_empty());
    }

    #[test]
    fn test_check_reports_every_failure() {
        let mut root = RootTask::default();
        root.push_child(print("a", "{missing}")).unwrap();
        root.push_child(TaskNode::new("s", TaskKind::Sleep(SleepTask::new("-1"))))
            .unwrap();
        let report = root.check(&CheckOptions::default());
        assert!(!report.is_ok());
        assert_eq!(report.failures().len(), 2);
        assert!(!report.failures_of("root/a").is_empty());
        assert!(!report.failures_of("root/s").is_empty());
    }

    #[test]
    fn test_request_child_delegates() {
        struct AlwaysPrint;
        impl ChildRequester for AlwaysPrint {
            fn request_child(&self, parent_path: &str) -> Option<TaskNode> {
                Some(print("new", parent_path))
            }
        }
        let root = RootTask::default();
        assert!(root.request_child(ROOT).is_none());
        let root = root.with_requester(Arc::new(AlwaysPrint));
        let child = root.request_child(ROOT).unwrap();
        assert_eq!(child.name(), "new");
    }
}
