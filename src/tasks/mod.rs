//! Protocol task tree.
//!
//! A protocol is a tree of [`TaskNode`]s under a [`RootTask`]. Tasks are
//! created detached, attached to a composite (which gives them a path, a
//! depth and the root context, then registers their namespace entries), and
//! can be checked, run, renamed, removed and saved as [`Preferences`].
//!
//! ## Task types
//!
//! | `task_id` | entries | notes |
//! |---|---|---|
//! | `Composite` | | children run in order |
//! | `Loop` | `index`, `value` | children run per value of a range |
//! | `Sleep` | | interruptible by default |
//! | `Print` | `message` | |
//! | `Definition` | one per definition | evaluated during check |
//! | `Formula` | one per formula | |
//! | `GetInstrumentProperty` | `value` | crash isolation on |
//! | `SetInstrumentProperty` | `value` | crash isolation on |
//!
//! [`Preferences`]: crate::preferences::Preferences

pub mod check;
pub mod composite;
pub mod instrument_tasks;
pub mod leaves;
pub mod loop_task;
pub mod node;
pub mod registry;
pub mod root;

pub use check::{CheckOptions, CheckReport};
pub use composite::CompositeTask;
pub use instrument_tasks::{GetPropertyTask, SetPropertyTask};
pub use leaves::{DefinitionTask, FormulaTask, PrintTask, SleepTask};
pub use loop_task::LoopTask;
pub use node::{RootContext, TaskKind, TaskNode, TaskScope};
pub use registry::TaskRegistry;
pub use root::{ChildRequester, RootTask};
