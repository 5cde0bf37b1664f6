//! Error types for the stepchart runtime
//!
//! Domain errors use thiserror. Each area gets its own enum and `Result`
//! alias, and `RuntimeError` aggregates them at the crate boundary.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Actor lifecycle errors
    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    /// Statechart definition or execution errors
    #[error("Machine error: {0}")]
    Machine(#[from] MachineError),

    /// Workflow compile or run errors
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    /// Snapshot store errors
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Rejected runtime configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Errors raised by actors and their logic
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ActorError {
    /// `stop()` was called on an actor that has a parent
    #[error("Actor '{0}' is not a root actor; stop it through its parent")]
    NotRoot(String),

    /// The actor logic failed while computing a snapshot
    #[error("Actor logic failed: {0}")]
    Logic(String),

    /// The statechart algorithm failed
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// Another actor already holds this system id
    #[error("Duplicate system id '{0}'")]
    DuplicateSystemId(String),

    /// A persisted snapshot could not be revived
    #[error("Cannot restore actor '{id}': {detail}")]
    Restore {
        /// Actor id
        id: String,
        /// What went wrong
        detail: String,
    },

    /// Future-backed logic was started outside a tokio runtime
    #[error("No async runtime available to start actor '{0}'")]
    NoAsyncRuntime(String),
}

/// Errors raised while compiling or stepping a statechart
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MachineError {
    /// A guard returned an error
    #[error("Guard '{guard}' failed for event '{event}' in state '{state}': {detail}")]
    GuardEvaluation {
        /// Guard name
        guard: String,
        /// Event type being processed
        event: String,
        /// State node whose transition owns the guard
        state: String,
        /// Underlying error
        detail: String,
    },

    /// The definition is malformed or refers to missing implementations
    #[error("Invalid machine configuration: {0}")]
    Configuration(String),

    /// A state value does not describe a legal configuration
    #[error("Invalid state value: {0}")]
    InvalidStateValue(String),

    /// The macrostep never reached a fixpoint
    #[error("Macrostep exceeded {limit} microsteps")]
    EventlessLoop {
        /// Configured microstep cap
        limit: usize,
    },

    /// An error event selected no transition
    #[error("Unhandled error event '{event}': {detail}")]
    UnhandledError {
        /// Error event type
        event: String,
        /// Error carried by the event
        detail: String,
    },
}

/// Errors raised by snapshot stores
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// IO failure
    #[error("IO error at {path:?}: {source}")]
    Io {
        /// Path being accessed
        path: PathBuf,
        /// Underlying error
        source: io::Error,
    },

    /// Record could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record failed its integrity check
    #[error("Corrupted record {path:?}: {detail}")]
    Corrupted {
        /// Record path
        path: PathBuf,
        /// Description of the mismatch
        detail: String,
    },

    /// Any other backend failure
    #[error("Store backend failed: {0}")]
    Backend(String),
}

/// Errors raised by workflow compilation and runs
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The step graph is malformed
    #[error("Invalid workflow '{workflow}': {detail}")]
    Configuration {
        /// Workflow name
        workflow: String,
        /// What is wrong
        detail: String,
    },

    /// No persisted state exists for the run
    #[error("Run '{run_id}' of workflow '{workflow}' not found")]
    RunNotFound {
        /// Workflow name
        workflow: String,
        /// Run id
        run_id: String,
    },

    /// Resume targeted a step that is not suspended
    #[error("Step '{0}' is not suspended")]
    NotSuspended(String),

    /// The run record holds no snapshot for a branch
    #[error("Run has no snapshot for branch '{0}'")]
    MissingBranch(String),

    /// A branch machine failed
    #[error("Branch '{branch}' failed: {source}")]
    Branch {
        /// Branch key
        branch: String,
        /// Actor error
        source: ActorError,
    },

    /// The statechart compiled from the step graph was rejected
    #[error(transparent)]
    Machine(#[from] MachineError),

    /// Snapshot store failure
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// A branch stopped before it settled
    #[error("Branch '{0}' stopped before settling")]
    Aborted(String),
}

/// Result alias for actor operations
pub type ActorResult<T> = std::result::Result<T, ActorError>;

/// Result alias for statechart operations
pub type MachineResult<T> = std::result::Result<T, MachineError>;

/// Result alias for snapshot store operations
pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Result alias for workflow operations
pub type WorkflowResult<T> = std::result::Result<T, WorkflowError>;

/// Result alias for top-level runtime operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
