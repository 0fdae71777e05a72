use std::collections::HashMap;
use std::sync::Arc;

use super::composite::CompositeTask;
use super::instrument_tasks::{GetPropertyTask, SetPropertyTask};
use super::leaves::{DefinitionTask, FormulaTask, PrintTask, SleepTask};
use super::loop_task::LoopTask;
use super::node::{RootContext, TaskKind, TaskNode};
use super::root::{RootTask, ROOT_TASK_ID};
use crate::contracts::{ExecutionPlan, WaitTarget};
use crate::error::{AppResult, DaqError};
use crate::preferences::Preferences;

type TaskBuilder = Box<dyn Fn(&Preferences, &TaskRegistry) -> AppResult<TaskKind> + Send + Sync>;

/// `task_id` → builder of the matching task kind.
pub struct TaskRegistry {
    builders: HashMap<String, TaskBuilder>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tasks", &self.task_ids())
            .finish()
    }
}

impl TaskRegistry {
    /// Registry knowing every built-in task.
    pub fn new() -> Self {
        let mut registry = Self {
            builders: HashMap::new(),
        };
        registry.register("Composite", |prefs, registry| {
            Ok(TaskKind::Composite(registry.build_children(prefs)?))
        });
        registry.register("Loop", |prefs, registry| {
            let body = registry.build_children(prefs)?;
            Ok(TaskKind::Loop(LoopTask::from_preferences(prefs, body)?))
        });
        registry.register("Sleep", |prefs, _| {
            Ok(TaskKind::Sleep(SleepTask::from_preferences(prefs)?))
        });
        registry.register("Print", |prefs, _| {
            Ok(TaskKind::Print(PrintTask::from_preferences(prefs)?))
        });
        registry.register("Definition", |prefs, _| {
            Ok(TaskKind::Definition(DefinitionTask::from_preferences(prefs)?))
        });
        registry.register("Formula", |prefs, _| {
            Ok(TaskKind::Formula(FormulaTask::from_preferences(prefs)?))
        });
        registry.register("GetInstrumentProperty", |prefs, _| {
            Ok(TaskKind::GetInstrumentProperty(
                GetPropertyTask::from_preferences(prefs)?,
            ))
        });
        registry.register("SetInstrumentProperty", |prefs, _| {
            Ok(TaskKind::SetInstrumentProperty(
                SetPropertyTask::from_preferences(prefs)?,
            ))
        });
        registry
    }

    /// Add or replace the builder of a task type.
    pub fn register<F>(&mut self, task_id: &str, builder: F)
    where
        F: Fn(&Preferences, &TaskRegistry) -> AppResult<TaskKind> + Send + Sync + 'static,
    {
        self.builders.insert(task_id.to_string(), Box::new(builder));
    }

    /// Known task types, sorted.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.builders.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Rebuild a detached task, and its subtree, from preferences.
    pub fn build_from_preferences(&self, prefs: &Preferences) -> AppResult<TaskNode> {
        let task_id = prefs.require("task_id")?;
        let builder = self
            .builders
            .get(task_id)
            .ok_or_else(|| DaqError::Build(format!("unknown task type '{}'", task_id)))?;
        let name = prefs.require("name")?;
        let kind = builder(prefs, self)?;
        let plan = plan_from_preferences(prefs, kind.isolates_crashes_by_default())?;
        Ok(TaskNode::new(name, kind).with_plan(plan))
    }

    /// Rebuild a root over `context`; every task gets attached and
    /// registered.
    pub fn build_root(&self, prefs: &Preferences, context: Arc<RootContext>) -> AppResult<RootTask> {
        match prefs.get("task_id") {
            None | Some(ROOT_TASK_ID) => {}
            Some(other) => {
                return Err(DaqError::Build(format!(
                    "expected a '{}' section, found '{}'",
                    ROOT_TASK_ID, other
                )))
            }
        }
        let mut root = RootTask::new(context);
        for child in prefs.child_sections()? {
            let task = self.build_from_preferences(child)?;
            root.push_child(task)?;
        }
        Ok(root)
    }

    fn build_children(&self, prefs: &Preferences) -> AppResult<CompositeTask> {
        let children = prefs
            .child_sections()?
            .into_iter()
            .map(|child| self.build_from_preferences(child))
            .collect::<AppResult<Vec<_>>>()?;
        CompositeTask::with_children(children)
    }
}

/// Contracts described by the `parallel`, `wait` and `crash_isolation` keys.
pub fn plan_from_preferences(prefs: &Preferences, isolate_default: bool) -> AppResult<ExecutionPlan> {
    let parallel = prefs.get("parallel").map(str::to_string);
    let wait = prefs.get("wait").map(parse_wait);
    let crash_isolation = prefs.parse_or("crash_isolation", isolate_default)?;
    ExecutionPlan::from_options(parallel, wait, crash_isolation)
}

/// `*` waits on every pool, otherwise a comma separated list of pools.
pub fn parse_wait(raw: &str) -> WaitTarget {
    let raw = raw.trim();
    if raw == "*" || raw.is_empty() {
        return WaitTarget::All;
    }
    WaitTarget::Pools(
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Inverse of [`parse_wait`].
pub fn wait_to_string(target: &WaitTarget) -> String {
    match target {
        WaitTarget::All => "*".to_string(),
        WaitTarget::Pools(pools) => pools.join(","),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::Contract;

    fn sequence() -> Preferences {
        Preferences::new()
            .with("task_id", "Root")
            .with("name", "root")
            .with_section(
                "children_0",
                Preferences::new()
                    .with("task_id", "Sleep")
                    .with("name", "wait_a_bit")
                    .with("time", "0.01")
                    .with("parallel", "default"),
            )
            .with_section(
                "children_1",
                Preferences::new()
                    .with("task_id", "Loop")
                    .with("name", "sweep")
                    .with("start", "0")
                    .with("stop", "2")
                    .with("wait", "*")
                    .with_section(
                        "children_0",
                        Preferences::new()
                            .with("task_id", "Print")
                            .with("name", "print")
                            .with("message", "{sweep_value}"),
                    ),
            )
    }

    #[test]
    fn test_build_dispatches_on_task_id() {
        let registry = TaskRegistry::new();
        let root = registry
            .build_root(&sequence(), Arc::new(RootContext::default()))
            .unwrap();
        let children = root.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].task_id(), "Sleep");
        assert_eq!(children[0].plan().parallel_pool(), Some("default"));
        assert_eq!(children[1].task_id(), "Loop");
        assert_eq!(children[1].children()[0].path(), "root/sweep");
        assert_eq!(children[1].children()[0].depth(), 2);
        assert_eq!(
            children[1].plan().contracts(),
            &[
                Contract::Stoppable,
                Contract::Wait {
                    target: WaitTarget::All
                }
            ]
        );
    }

    #[test]
    fn test_preferences_round_trip() {
        let registry = TaskRegistry::new();
        let root = registry
            .build_root(&sequence(), Arc::new(RootContext::default()))
            .unwrap();
        let saved = root.preferences();
        let rebuilt = registry
            .build_root(&saved, Arc::new(RootContext::default()))
            .unwrap();
        assert_eq!(rebuilt.children(), root.children());
        assert_eq!(rebuilt.preferences(), saved);
    }

    #[test]
    fn test_unknown_task_id() {
        let registry = TaskRegistry::new();
        let prefs = Preferences::new().with("task_id", "Teleport").with("name", "t");
        assert!(matches!(
            registry.build_from_preferences(&prefs),
            Err(DaqError::Build(ref msg)) if msg.contains("Teleport")
        ));
    }

    #[test]
    fn test_missing_field() {
        let registry = TaskRegistry::new();
        let prefs = Preferences::new().with("task_id", "Sleep").with("name", "s");
        assert!(matches!(
            registry.build_from_preferences(&prefs),
            Err(DaqError::Build(_))
        ));
    }

    #[test]
    fn test_parse_wait() {
        assert_eq!(parse_wait("*"), WaitTarget::All);
        assert_eq!(
            parse_wait("instr, daq"),
            WaitTarget::Pools(vec!["instr".into(), "daq".into()])
        );
        assert_eq!(wait_to_string(&parse_wait("a,b")), "a,b");
    }

    #[test]
    fn test_wait_on_no_pool_does_not_build() {
        let prefs = Preferences::new().with("wait", " , ");
        assert_eq!(parse_wait(" , "), WaitTarget::Pools(vec![]));
        assert!(matches!(
            plan_from_preferences(&prefs, false),
            Err(DaqError::Build(_))
        ));
    }
}
