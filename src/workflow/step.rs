//! Steps and the handler boundary
//!
//! A step is an id plus an async handler. Handlers receive a `StepContext`
//! with read access to the run and a `suspend` control; they never see the
//! statechart that drives them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::{ConditionEvaluator, StepCondition, value_at};

type Handler = dyn Fn(StepContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A unit of work in a workflow
#[derive(Clone)]
pub struct Step {
    id: String,
    handler: Arc<Handler>,
}

impl Step {
    /// Create a step from an async handler
    pub fn new<F, Fut>(id: impl Into<String>, handler: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            handler: Arc::new(move |context| handler(context).boxed()),
        }
    }

    /// Step id, unique within a workflow
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn run(&self, context: StepContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.handler)(context)
    }
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Step({})", self.id)
    }
}

/// Recorded outcome of a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepResult {
    /// Handler returned
    Success {
        /// Handler output
        output: Value,
    },
    /// Handler or condition failed with no attempts left
    Failed {
        /// Error message
        error: String,
    },
    /// Handler asked to pause
    Suspended {
        /// Suspend payload
        payload: Value,
    },
    /// Condition unmet
    Skipped,
}

impl StepResult {
    /// Output of a successful step
    pub fn output(&self) -> Option<&Value> {
        match self {
            StepResult::Success { output } => Some(output),
            _ => None,
        }
    }

    /// Whether the step reached a status that releases compound dependencies
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepResult::Suspended { .. })
    }
}

/// Handler-visible view of a run
#[derive(Clone)]
pub struct StepContext {
    pub(crate) step_id: String,
    pub(crate) run_id: String,
    pub(crate) workflow: String,
    pub(crate) trigger_data: Value,
    pub(crate) steps: BTreeMap<String, StepResult>,
    pub(crate) input: Value,
    pub(crate) resume_payload: Option<Value>,
    pub(crate) evaluator: Arc<dyn ConditionEvaluator>,
    pub(crate) suspension: Arc<Mutex<Option<Value>>>,
}

impl StepContext {
    /// Id of the running step
    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    /// Id of the run
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Name of the workflow
    pub fn workflow(&self) -> &str {
        &self.workflow
    }

    /// Data the run was started with
    pub fn trigger_data(&self) -> &Value {
        &self.trigger_data
    }

    /// Results recorded so far
    pub fn steps(&self) -> &BTreeMap<String, StepResult> {
        &self.steps
    }

    /// Output of a successful prior step
    pub fn step_output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(StepResult::output)
    }

    /// Resolved variable bindings, an object keyed by variable name
    pub fn input(&self) -> &Value {
        &self.input
    }

    /// Payload supplied by the resume that restarted this step
    pub fn resume_payload(&self) -> Option<&Value> {
        self.resume_payload.as_ref()
    }

    /// Evaluate a condition against this run
    pub fn evaluate(&self, condition: &StepCondition) -> anyhow::Result<bool> {
        condition.evaluate(self.evaluator.as_ref(), &self.steps, &self.trigger_data)
    }

    /// Ask the run-time to park this step once the handler returns
    pub async fn suspend(&self, payload: Value) {
        *self.suspension.lock() = Some(payload);
    }

    pub(crate) fn take_suspension(&self) -> Option<Value> {
        self.suspension.lock().take()
    }
}

/// Timed retry of a failing handler
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first failure
    pub attempts: u32,
    /// Pause before each retry; the runtime default when unset
    pub delay: Option<Duration>,
}

/// Where a variable binding reads from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarRef {
    /// Step id, or `trigger` for the trigger data
    pub step: String,
    /// Dotted path into the source value; empty for the whole value
    pub path: String,
}

impl VarRef {
    /// Read from a prior step's output
    pub fn step(step: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            path: path.into(),
        }
    }

    /// Read from the trigger data
    pub fn trigger(path: impl Into<String>) -> Self {
        Self::step(TRIGGER, path)
    }

    pub(crate) fn resolve(&self, steps: &BTreeMap<String, StepResult>, trigger_data: &Value) -> Value {
        let source = if self.step == TRIGGER {
            Some(trigger_data)
        } else {
            steps.get(&self.step).and_then(StepResult::output)
        };
        source
            .and_then(|source| value_at(source, &self.path))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Source name for trigger data in bindings and conditions
pub const TRIGGER: &str = "trigger";

/// Routing of a step whose condition is not met
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnmetPolicy {
    /// Run subscribers if any branch depends on the step, otherwise stop in limbo
    #[default]
    Auto,
    /// Stop the region without running subscribers
    Limbo,
    /// Treat the step as completed
    SkipToCompleted,
    /// Skip the handler but run subscribers
    RunSubscribers,
}

/// Per-step options
#[derive(Clone, Debug, Default)]
pub struct StepOptions {
    pub(crate) when: Option<StepCondition>,
    pub(crate) variables: BTreeMap<String, VarRef>,
    pub(crate) retry: RetryConfig,
    pub(crate) on_unmet: UnmetPolicy,
}

impl StepOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Only execute when the condition holds
    pub fn when(mut self, condition: StepCondition) -> Self {
        self.when = Some(condition);
        self
    }

    /// Bind a variable into the handler input
    pub fn variable(mut self, name: impl Into<String>, source: VarRef) -> Self {
        self.variables.insert(name.into(), source);
        self
    }

    /// Retry a failing handler
    pub fn retry(mut self, attempts: u32, delay: Option<Duration>) -> Self {
        self.retry = RetryConfig { attempts, delay };
        self
    }

    /// Routing when the condition is unmet
    pub fn on_unmet(mut self, policy: UnmetPolicy) -> Self {
        self.on_unmet = policy;
        self
    }

    pub(crate) fn resolve_input(&self, steps: &BTreeMap<String, StepResult>, trigger_data: &Value) -> Value {
        Value::Object(
            self.variables
                .iter()
                .map(|(name, source)| (name.clone(), source.resolve(steps, trigger_data)))
                .collect(),
        )
    }
}
