//! Stepchart – hierarchical statecharts on an actor runtime, with durable workflows
//!
//! This crate implements:
//! - An actor runtime: mailboxes, parent/child actor trees, Systems with
//!   keyed registration and cancellable delayed events
//! - Statecharts: compound, parallel, final and history states, guarded and
//!   eventless transitions, delayed transitions, invoked and spawned actors
//! - Persisted snapshots that revive a whole actor tree
//! - A workflow engine that lowers step graphs into statecharts and persists
//!   every transition so suspended runs can be resumed

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Actor runtime: mailboxes, actors, Systems, timers, snapshots
pub mod runtime;

/// Statechart definitions and the interpreter
pub mod machine;

/// Workflow builder, compiler and run-time
pub mod workflow;

// Re-export key types for convenience
pub use machine::{MachineConfig, StateConfig, StateMachine, TransitionConfig};
pub use runtime::{Actor, ActorRef, Event, RuntimeConfig, Snapshot, System};
pub use workflow::{Step, Workflow, WorkflowInstance};

/// Current version of the stepchart crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
