//! Durable workflows on top of the statechart runtime
//!
//! A `Workflow` is built fluently from steps, committed into an immutable
//! step graph, and run through `WorkflowInstance`. Each branch of a run is
//! lowered into its own statechart; every committed snapshot is persisted
//! through a `SnapshotStore`, and suspended steps can be resumed later, even
//! from another process.

pub mod compile;
pub mod condition;
pub mod graph;
pub mod instance;
mod machine;
pub mod step;
pub mod store;

pub use condition::{ConditionEvaluator, Predicate, QueryEvaluator, StepCondition};
pub use graph::{StepGraph, StepNode, Workflow, WorkflowBuilder};
pub use instance::{RunResult, RunStatus, WorkflowInstance};
pub use step::{RetryConfig, Step, StepContext, StepOptions, StepResult, UnmetPolicy, VarRef};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, WorkflowRunState};
