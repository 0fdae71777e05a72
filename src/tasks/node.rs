//! Task nodes and their shared run-time context.
//!
//! A [`TaskNode`] carries what every task has in common (name, location in
//! the tree, execution plan, link to the root context) and a [`TaskKind`]
//! holding the variant specific data. Only the composite-like kinds
//! (`Composite` and `Loop`) own children, and both delegate the traversal to
//! [`CompositeTask`].
//!
//! ## Location
//!
//! ```text
//! root                      (path "root")
//! ├── sleep                 path "root",       writes nothing
//! ├── scan (Composite)      path "root",       node "root/scan"
//! │   └── print             path "root/scan",  writes "root/scan/print_message"
//! └── sweep (Loop)          path "root",       writes "root/sweep_index"
//! ```
//!
//! A task writes its entries, named `<task name>_<entry>`, in the namespace
//! node at its path. Composite-like tasks also own the node
//! `<path>/<name>` where their children live.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::check::{CheckOptions, CheckReport};
use super::composite::CompositeTask;
use super::instrument_tasks::{GetPropertyTask, SetPropertyTask};
use super::leaves::{DefinitionTask, FormulaTask, PrintTask, SleepTask};
use super::loop_task::LoopTask;
use crate::contracts::{ExecutionPlan, RunControl, StopFlag};
use crate::database::path::{self, ROOT};
use crate::database::TaskDatabase;
use crate::error::{AppResult, DaqError};
use crate::eval::FormulaEngine;
use crate::instrument::InstrumentPool;
use crate::preferences::Preferences;

// =============================================================================
// Root context
// =============================================================================

/// State owned by the root and shared by every attached task.
#[derive(Debug)]
pub struct RootContext {
    /// Namespace written by the tasks.
    pub database: Arc<TaskDatabase>,
    /// Stop flag, pending threads and absorbed failures.
    pub control: RunControl,
    /// Instrument connections.
    pub instruments: Arc<InstrumentPool>,
    /// Formula evaluator.
    pub formulas: FormulaEngine,
}

impl Default for RootContext {
    fn default() -> Self {
        Self::new(
            Arc::new(TaskDatabase::new()),
            Arc::new(InstrumentPool::default()),
        )
    }
}

impl RootContext {
    /// Context over an existing database and instrument pool.
    pub fn new(database: Arc<TaskDatabase>, instruments: Arc<InstrumentPool>) -> Self {
        Self {
            database,
            control: RunControl::default(),
            instruments,
            formulas: FormulaEngine::default(),
        }
    }

    /// The cooperative stop flag of the tree.
    pub fn stop_flag(&self) -> &StopFlag {
        &self.control.stop
    }
}

// =============================================================================
// Task kinds
// =============================================================================

/// Closed set of task variants.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Ordered children run one after the other.
    Composite(CompositeTask),
    /// Children run once per value of a numeric range.
    Loop(LoopTask),
    /// Wait for some time.
    Sleep(SleepTask),
    /// Format and publish a message.
    Print(PrintTask),
    /// Constants evaluated when checking and running.
    Definition(DefinitionTask),
    /// Values evaluated when running.
    Formula(FormulaTask),
    /// Read an instrument property.
    GetInstrumentProperty(GetPropertyTask),
    /// Write an instrument property.
    SetInstrumentProperty(SetPropertyTask),
}

impl TaskKind {
    /// Type name written under the `task_id` key.
    pub fn task_id(&self) -> &'static str {
        match self {
            TaskKind::Composite(_) => "Composite",
            TaskKind::Loop(_) => "Loop",
            TaskKind::Sleep(_) => "Sleep",
            TaskKind::Print(_) => "Print",
            TaskKind::Definition(_) => "Definition",
            TaskKind::Formula(_) => "Formula",
            TaskKind::GetInstrumentProperty(_) => "GetInstrumentProperty",
            TaskKind::SetInstrumentProperty(_) => "SetInstrumentProperty",
        }
    }

    /// Entries written by this kind with their initial value.
    pub fn entries(&self) -> Vec<(String, Value)> {
        match self {
            TaskKind::Composite(_) | TaskKind::Sleep(_) => Vec::new(),
            TaskKind::Loop(_) => LoopTask::entries(),
            TaskKind::Print(_) => PrintTask::entries(),
            TaskKind::Definition(t) => t.entries(),
            TaskKind::Formula(t) => t.entries(),
            TaskKind::GetInstrumentProperty(_) => GetPropertyTask::entries(),
            TaskKind::SetInstrumentProperty(_) => SetPropertyTask::entries(),
        }
    }

    /// Whether crash isolation is on unless configured otherwise.
    pub fn isolates_crashes_by_default(&self) -> bool {
        matches!(
            self,
            TaskKind::GetInstrumentProperty(_) | TaskKind::SetInstrumentProperty(_)
        )
    }

    fn body(&self) -> Option<&CompositeTask> {
        match self {
            TaskKind::Composite(c) => Some(c),
            TaskKind::Loop(l) => Some(&l.body),
            _ => None,
        }
    }

    fn body_mut(&mut self) -> Option<&mut CompositeTask> {
        match self {
            TaskKind::Composite(c) => Some(c),
            TaskKind::Loop(l) => Some(&mut l.body),
            _ => None,
        }
    }

    fn write_preferences(&self, prefs: &mut Preferences) {
        match self {
            TaskKind::Composite(_) => {}
            TaskKind::Loop(t) => t.write_preferences(prefs),
            TaskKind::Sleep(t) => t.write_preferences(prefs),
            TaskKind::Print(t) => t.write_preferences(prefs),
            TaskKind::Definition(t) => t.write_preferences(prefs),
            TaskKind::Formula(t) => t.write_preferences(prefs),
            TaskKind::GetInstrumentProperty(t) => t.write_preferences(prefs),
            TaskKind::SetInstrumentProperty(t) => t.write_preferences(prefs),
        }
    }
}

// =============================================================================
// Task scope
// =============================================================================

/// An attached task together with its root context.
pub struct TaskScope<'a> {
    /// The task being checked or run.
    pub node: &'a TaskNode,
    /// Its root context.
    pub context: &'a RootContext,
}

impl TaskScope<'_> {
    /// `<path>/<name>` of the task.
    pub fn full_path(&self) -> String {
        self.node.full_path()
    }

    /// Write one of the task's declared entries.
    pub fn write(&self, entry: &str, value: Value) -> AppResult<()> {
        self.context
            .database
            .set_value(&self.node.path, &self.node.entry_name(entry), value)
            .map(|_| ())
    }

    /// Replace `{name}` placeholders with database values.
    pub fn format(&self, template: &str) -> AppResult<String> {
        self.context
            .formulas
            .format(template, &self.node.path, &self.context.database)
    }

    /// Evaluate a formula.
    pub fn evaluate(&self, template: &str) -> AppResult<Value> {
        self.context
            .formulas
            .evaluate(template, &self.node.path, &self.context.database)
    }

    /// Evaluate a formula that must produce a number.
    pub fn evaluate_number(&self, template: &str) -> AppResult<f64> {
        let value = self.evaluate(template)?;
        value.as_f64().ok_or_else(|| {
            DaqError::Evaluation(format!("'{}' gave {} instead of a number", template, value))
        })
    }

    /// Whether the root asked the tree to stop.
    pub fn stop_requested(&self) -> bool {
        self.context.control.stop.is_set()
    }
}

// =============================================================================
// Task node
// =============================================================================

/// One node of the protocol tree.
#[derive(Debug, Clone)]
pub struct TaskNode {
    name: String,
    path: String,
    depth: usize,
    plan: ExecutionPlan,
    context: Option<Arc<RootContext>>,
    kind: TaskKind,
}

impl PartialEq for TaskNode {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.plan == other.plan && self.kind == other.kind
    }
}

impl TaskNode {
    /// Create a detached task with the default plan of its kind.
    pub fn new(name: &str, kind: TaskKind) -> Self {
        let plan = if kind.isolates_crashes_by_default() {
            ExecutionPlan::from_options(None, None, true).unwrap_or_default()
        } else {
            ExecutionPlan::default()
        };
        Self {
            name: name.to_string(),
            path: ROOT.to_string(),
            depth: 0,
            plan,
            context: None,
            kind,
        }
    }

    /// Replace the execution plan.
    pub fn with_plan(mut self, plan: ExecutionPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the namespace node holding this task's entries.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Distance from the root (children of the root have depth 1).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// `<path>/<name>`.
    pub fn full_path(&self) -> String {
        path::join(&self.path, &self.name)
    }

    /// Contracts wrapping [`TaskNode::perform`].
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Variant data.
    pub fn kind(&self) -> &TaskKind {
        &self.kind
    }

    /// Type name of the task.
    pub fn task_id(&self) -> &'static str {
        self.kind.task_id()
    }

    /// Whether the task is attached to a root.
    pub fn is_attached(&self) -> bool {
        self.context.is_some()
    }

    /// Stored name of one of the task's entries.
    pub fn entry_name(&self, entry: &str) -> String {
        format!("{}_{}", self.name, entry)
    }

    /// Full namespace path of every entry this task writes.
    pub fn entry_paths(&self) -> Vec<String> {
        self.kind
            .entries()
            .into_iter()
            .map(|(entry, _)| path::join(&self.path, &self.entry_name(&entry)))
            .collect()
    }

    /// Children of a composite-like task, empty for leaves.
    pub fn children(&self) -> &[TaskNode] {
        self.kind.body().map(CompositeTask::children).unwrap_or(&[])
    }

    /// Insert a child of a composite-like task.
    pub fn add_child(&mut self, index: usize, child: TaskNode) -> AppResult<()> {
        let children_path = self.full_path();
        let depth = self.depth + 1;
        let context = self.context.clone();
        self.body_mut()?
            .insert(index, child, &children_path, depth, context)
    }

    /// Detach and return a child of a composite-like task.
    pub fn remove_child(&mut self, index: usize) -> AppResult<TaskNode> {
        self.body_mut()?.remove(index)
    }

    /// Rename a child of a composite-like task.
    pub fn rename_child(&mut self, index: usize, new_name: &str) -> AppResult<()> {
        self.body_mut()?.rename(index, new_name)
    }

    /// Descendant whose full path is `full_path`.
    pub fn find_mut(&mut self, full_path: &str) -> Option<&mut TaskNode> {
        self.kind.body_mut()?.find_mut(full_path)
    }

    fn body_mut(&mut self) -> AppResult<&mut CompositeTask> {
        let id = self.kind.task_id();
        let name = self.name.clone();
        self.kind
            .body_mut()
            .ok_or_else(|| DaqError::Build(format!("{} task '{}' has no children", id, name)))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Move the task, and its subtree, to a new location.
    pub(crate) fn relocate(
        &mut self,
        path: &str,
        depth: usize,
        context: Option<Arc<RootContext>>,
    ) {
        self.path = path.to_string();
        self.depth = depth;
        self.context = context.clone();
        let children_path = self.full_path();
        if let Some(body) = self.kind.body_mut() {
            body.relocate(&children_path, depth + 1, context);
        }
    }

    /// Create the task's entries (and its node for composite-like tasks),
    /// then register the children.
    pub fn register_in_database(&self) -> AppResult<()> {
        let Some(context) = &self.context else {
            return Ok(());
        };
        let db = &context.database;
        for (entry, value) in self.kind.entries() {
            db.set_value(&self.path, &self.entry_name(&entry), value)?;
        }
        if let Some(body) = self.kind.body() {
            db.create_node(&self.path, &self.name)?;
            body.register_in_database()?;
        }
        Ok(())
    }

    /// Remove the task's entries, unregister the children, then remove the
    /// task's node.
    pub fn unregister_from_database(&self) -> AppResult<()> {
        let Some(context) = &self.context else {
            return Ok(());
        };
        let db = &context.database;
        for (entry, _) in self.kind.entries() {
            match db.delete_value(&self.path, &self.entry_name(&entry)) {
                Ok(()) | Err(DaqError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(body) = self.kind.body() {
            body.unregister_from_database()?;
            if db.has_node(&self.full_path()) {
                db.delete_node(&self.path, &self.name)?;
            }
        }
        Ok(())
    }

    /// Rename the task, moving its entries and, for composite-like tasks,
    /// its namespace node and every descendant path.
    ///
    /// Sibling uniqueness is checked by the parent, see
    /// [`TaskNode::rename_child`].
    pub(crate) fn rename(&mut self, new_name: &str) -> AppResult<()> {
        path::validate_name(new_name)?;
        if new_name == self.name {
            return Ok(());
        }
        if let Some(context) = &self.context {
            let db = &context.database;
            for (entry, _) in self.kind.entries() {
                db.rename_value(
                    &self.path,
                    &self.entry_name(&entry),
                    &format!("{}_{}", new_name, entry),
                )?;
            }
            if self.kind.body().is_some() {
                db.rename_node(&self.path, new_name, &self.name)?;
            }
        }
        debug!(old = %self.name, new = new_name, "Task renamed");
        self.name = new_name.to_string();
        let (path, depth, context) = (self.path.clone(), self.depth, self.context.clone());
        self.relocate(&path, depth, context);
        Ok(())
    }

    // =========================================================================
    // Check and perform
    // =========================================================================

    /// Validate the task and its subtree.
    pub fn check(&self, options: &CheckOptions) -> CheckReport {
        let mut report = CheckReport::new();
        let Some(context) = &self.context else {
            report.fail(&self.full_path(), "task is not attached to a root");
            return report;
        };
        let scope = TaskScope {
            node: self,
            context,
        };
        match &self.kind {
            TaskKind::Composite(c) => report.merge(c.check(options)),
            TaskKind::Loop(t) => t.check(&scope, options, &mut report),
            TaskKind::Sleep(t) => t.check(&scope, &mut report),
            TaskKind::Print(t) => t.check(&scope, &mut report),
            TaskKind::Definition(t) => t.check(&scope, &mut report),
            TaskKind::Formula(t) => t.check(&scope, &mut report),
            TaskKind::GetInstrumentProperty(t) => t.check(&scope, options, &mut report),
            TaskKind::SetInstrumentProperty(t) => t.check(&scope, options, &mut report),
        }
        report
    }

    /// Run the task through its execution plan.
    pub fn perform(&self) -> AppResult<()> {
        let context = self.context.clone().ok_or_else(|| {
            DaqError::Build(format!("task '{}' is not attached to a root", self.full_path()))
        })?;
        let task = self.clone();
        let body_context = context.clone();
        self.plan.run(
            &context.control,
            &self.full_path(),
            Arc::new(move || task.execute(&body_context)),
        )
    }

    fn execute(&self, context: &RootContext) -> AppResult<()> {
        debug!(task = %self.full_path(), kind = self.task_id(), "Task started");
        let scope = TaskScope {
            node: self,
            context,
        };
        let result = match &self.kind {
            TaskKind::Composite(c) => c.perform(),
            TaskKind::Loop(t) => t.perform(&scope),
            TaskKind::Sleep(t) => t.perform(&scope),
            TaskKind::Print(t) => t.perform(&scope),
            TaskKind::Definition(t) => t.perform(&scope),
            TaskKind::Formula(t) => t.perform(&scope),
            TaskKind::GetInstrumentProperty(t) => t.perform(&scope),
            TaskKind::SetInstrumentProperty(t) => t.perform(&scope),
        };
        if let Err(e) = &result {
            warn!(task = %self.full_path(), error = %e, "Task failed");
        }
        result
    }

    // =========================================================================
    // Preferences
    // =========================================================================

    /// Preference map rebuilding this task and its subtree.
    pub fn preferences(&self) -> Preferences {
        let mut prefs = Preferences::new()
            .with("task_id", self.task_id())
            .with("name", &self.name)
            .with("crash_isolation", self.plan.isolates_crashes());
        if let Some(pool) = self.plan.parallel_pool() {
            prefs.set("parallel", pool);
        }
        if let Some(target) = self.plan.wait_target() {
            prefs.set("wait", super::registry::wait_to_string(target));
        }
        self.kind.write_preferences(&mut prefs);
        if let Some(body) = self.kind.body() {
            prefs.set_children(body.children_preferences());
        }
        prefs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::leaves::PrintTask;

    #[test]
    fn test_detached_task_cannot_run() {
        let task = TaskNode::new("print", TaskKind::Print(PrintTask::new("x")));
        assert!(!task.is_attached());
        assert!(matches!(task.perform(), Err(DaqError::Build(_))));
        assert!(!task.check(&CheckOptions::default()).is_ok());
    }

    #[test]
    fn test_instrument_tasks_isolate_crashes_by_default() {
        let get = TaskNode::new(
            "read",
            TaskKind::GetInstrumentProperty(GetPropertyTask::new("source", "voltage")),
        );
        assert!(get.plan().isolates_crashes());
        let print = TaskNode::new("print", TaskKind::Print(PrintTask::new("x")));
        assert!(!print.plan().isolates_crashes());
    }

    #[test]
    fn test_leaves_have_no_children() {
        let mut task = TaskNode::new("print", TaskKind::Print(PrintTask::new("x")));
        assert!(task.children().is_empty());
        let child = TaskNode::new("other", TaskKind::Print(PrintTask::new("y")));
        assert!(matches!(task.add_child(0, child), Err(DaqError::Build(_))));
    }
}
