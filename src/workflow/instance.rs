//! Workflow runs
//!
//! `RunShared` is the state every branch of one run shares: the result
//! ledger, the suspended set, the last persisted snapshot of each branch and
//! the store. Branch statecharts reach it through the future-backed actors
//! they invoke; handlers never see it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::compile::{compile_branch, pending_target};
use super::graph::{KEY_SEPARATOR, ROOT_BRANCH, StepNode, WorkflowDef};
use super::machine::run_branch;
use super::step::{StepContext, StepResult, UnmetPolicy};
use super::store::{SnapshotStore, WorkflowRunState};
use crate::runtime::RuntimeConfig;
use crate::runtime::error::{WorkflowError, WorkflowResult};
use crate::runtime::snapshot::{PersistedSnapshot, SnapshotStatus};

#[derive(Default)]
struct Ledger {
    results: BTreeMap<String, StepResult>,
    suspended: BTreeMap<String, String>,
    resume: BTreeMap<String, Value>,
    claimed: BTreeSet<String>,
}

pub(crate) struct RunShared {
    pub(crate) workflow: Arc<WorkflowDef>,
    pub(crate) run_id: String,
    pub(crate) config: RuntimeConfig,
    trigger_data: RwLock<Value>,
    ledger: Mutex<Ledger>,
    branches: Mutex<BTreeMap<String, PersistedSnapshot>>,
    store: Arc<dyn SnapshotStore>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl RunShared {
    pub(crate) fn trigger_data(&self) -> Value {
        self.trigger_data.read().clone()
    }

    pub(crate) fn results(&self) -> BTreeMap<String, StepResult> {
        self.ledger.lock().results.clone()
    }

    pub(crate) fn results_json(&self) -> Value {
        serde_json::to_value(self.results()).unwrap_or_else(|_| json!({}))
    }

    /// Route a pending step; records `skipped` or `failed` when it will not run
    pub(crate) fn check(&self, node: &StepNode) -> Value {
        let id = node.id();
        let trigger_data = self.trigger_data();
        let mut guard = self.ledger.lock();
        let ledger = &mut *guard;

        if let Some(StepResult::Suspended { .. }) = ledger.results.get(id) {
            return json!({ "outcome": "suspended" });
        }
        let met = match &node.options.when {
            Some(condition) => condition.evaluate(self.workflow.evaluator.as_ref(), &ledger.results, &trigger_data),
            None => Ok(true),
        };
        match met {
            Ok(true) => json!({ "outcome": "executing" }),
            Ok(false) => {
                let outcome = match node.options.on_unmet {
                    UnmetPolicy::Limbo => "limbo",
                    UnmetPolicy::SkipToCompleted => "completed",
                    UnmetPolicy::RunSubscribers => "runningSubscribers",
                    UnmetPolicy::Auto if self.workflow.subscriber_keys(id).is_empty() => "limbo",
                    UnmetPolicy::Auto => "runningSubscribers",
                };
                let result = ledger
                    .results
                    .entry(id.to_string())
                    .or_insert(StepResult::Skipped)
                    .clone();
                tracing::debug!(run_id = %self.run_id, step = %id, outcome, "condition not met");
                json!({ "outcome": outcome, "result": result })
            }
            Err(err) => {
                let result = StepResult::Failed {
                    error: format!("condition evaluation failed: {err:#}"),
                };
                ledger.results.insert(id.to_string(), result.clone());
                tracing::warn!(run_id = %self.run_id, step = %id, error = %format!("{err:#}"), "condition failed");
                json!({ "outcome": "failed", "result": result })
            }
        }
    }

    fn step_context(&self, node: &StepNode) -> StepContext {
        let trigger_data = self.trigger_data();
        let ledger = self.ledger.lock();
        StepContext {
            step_id: node.id().to_string(),
            run_id: self.run_id.clone(),
            workflow: self.workflow.name.clone(),
            input: node.options.resolve_input(&ledger.results, &trigger_data),
            steps: ledger.results.clone(),
            trigger_data,
            resume_payload: ledger.resume.get(node.id()).cloned(),
            evaluator: self.workflow.evaluator.clone(),
            suspension: Arc::default(),
        }
    }

    /// Run a step handler and record its result
    pub(crate) fn execute(self: Arc<Self>, node: StepNode, branch: String) -> BoxFuture<'static, anyhow::Result<Value>> {
        async move {
            let context = self.step_context(&node);
            let started = Instant::now();
            let output = match node.step.run(context.clone()).await {
                Ok(output) => output,
                Err(err) => {
                    tracing::warn!(run_id = %self.run_id, step = %node.id(), error = %format!("{err:#}"), "step handler failed");
                    return Err(err);
                }
            };

            let result = match context.take_suspension() {
                Some(payload) => StepResult::Suspended { payload },
                None => StepResult::Success { output },
            };
            let suspended = matches!(result, StepResult::Suspended { .. });
            {
                let mut ledger = self.ledger.lock();
                ledger.resume.remove(node.id());
                if suspended {
                    ledger.suspended.insert(node.id().to_string(), branch);
                }
                ledger.results.insert(node.id().to_string(), result.clone());
            }
            tracing::info!(
                run_id = %self.run_id,
                step = %node.id(),
                suspended,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "step finished"
            );
            Ok(json!({ "suspended": suspended, "result": result }))
        }
        .boxed()
    }

    pub(crate) fn record_failure(&self, step_id: &str, error: String) {
        tracing::warn!(run_id = %self.run_id, step = %step_id, %error, "step failed");
        self.ledger
            .lock()
            .results
            .insert(step_id.to_string(), StepResult::Failed { error });
    }

    /// Run every subscriber branch released by `step_id`
    pub(crate) fn run_subscribers(self: Arc<Self>, step_id: String) -> BoxFuture<'static, anyhow::Result<Value>> {
        async move {
            let mut branches = Vec::new();
            for key in self.workflow.subscriber_keys(&step_id) {
                if key.contains(KEY_SEPARATOR) {
                    let mut ledger = self.ledger.lock();
                    let ready = key
                        .split(KEY_SEPARATOR)
                        .all(|part| ledger.results.get(part).is_some_and(StepResult::is_terminal));
                    if !ready || !ledger.claimed.insert(key.clone()) {
                        continue;
                    }
                }
                tracing::debug!(run_id = %self.run_id, step = %step_id, branch = %key, "releasing subscribers");
                branches.push(run_branch(self.clone(), key, None));
            }
            for outcome in join_all(branches).await {
                if let Err(err) = outcome {
                    tracing::error!(run_id = %self.run_id, step = %step_id, error = %err, "subscriber branch failed");
                }
            }
            Ok(json!({ "steps": self.results_json() }))
        }
        .boxed()
    }

    pub(crate) async fn persist_branch(&self, key: &str, snapshot: PersistedSnapshot) {
        self.branches.lock().insert(key.to_string(), snapshot);
        if let Err(err) = self.save().await {
            tracing::warn!(run_id = %self.run_id, branch = %key, error = %err, "failed to persist run state");
        }
    }

    async fn save(&self) -> WorkflowResult<()> {
        let _guard = self.persist_lock.lock().await;
        let update = self.run_state();
        let name = &self.workflow.name;
        let mut record = self
            .store
            .load(name, &self.run_id)
            .await?
            .unwrap_or_else(|| WorkflowRunState::new(Value::Null));
        record.merge(update);
        self.store.save(name, &self.run_id, &record).await?;
        Ok(())
    }

    fn run_state(&self) -> WorkflowRunState {
        let (suspended_steps, step_results) = {
            let ledger = self.ledger.lock();
            (ledger.suspended.clone(), ledger.results.clone())
        };
        let branches = self.branches.lock();
        WorkflowRunState {
            root_snapshot: branches.get(ROOT_BRANCH).cloned(),
            child_states: branches
                .iter()
                .filter(|(key, _)| key.as_str() != ROOT_BRANCH)
                .map(|(key, snapshot)| (key.clone(), snapshot.clone()))
                .collect(),
            suspended_steps,
            step_results,
            trigger_data: self.trigger_data(),
            updated_at: Utc::now(),
        }
    }

    /// Fill in whatever this process does not know yet from a stored record
    fn hydrate(&self, state: &WorkflowRunState) {
        {
            let mut ledger = self.ledger.lock();
            for (id, result) in state.results() {
                ledger.results.entry(id).or_insert(result);
            }
            for (step, branch) in &state.suspended_steps {
                ledger.suspended.entry(step.clone()).or_insert_with(|| branch.clone());
            }
        }
        {
            let mut trigger_data = self.trigger_data.write();
            if trigger_data.is_null() {
                *trigger_data = state.trigger_data.clone();
            }
        }
        let mut branches = self.branches.lock();
        if let Some(root) = &state.root_snapshot {
            branches.entry(ROOT_BRANCH.to_string()).or_insert_with(|| root.clone());
        }
        for (key, snapshot) in &state.child_states {
            branches.entry(key.clone()).or_insert_with(|| snapshot.clone());
        }
    }

    /// Turn a suspended result into success and queue the resume payload
    fn mark_resumed(&self, step_id: &str, payload: &Value) -> StepResult {
        let mut ledger = self.ledger.lock();
        let suspended = match ledger.results.get(step_id) {
            Some(StepResult::Suspended { payload }) => payload.clone(),
            _ => Value::Null,
        };
        let output = match (suspended, payload) {
            (Value::Object(mut base), Value::Object(update)) => {
                base.extend(update.clone());
                Value::Object(base)
            }
            (Value::Null, update) => update.clone(),
            (base, Value::Null) => base,
            (_, update) => update.clone(),
        };
        let result = StepResult::Success { output };
        ledger.results.insert(step_id.to_string(), result.clone());
        ledger.suspended.remove(step_id);
        ledger.resume.insert(step_id.to_string(), payload.clone());
        result
    }

    fn result(&self) -> RunResult {
        let ledger = self.ledger.lock();
        let status = if ledger.results.values().any(|result| matches!(result, StepResult::Failed { .. })) {
            RunStatus::Failed
        } else if !ledger.suspended.is_empty() {
            RunStatus::Suspended
        } else {
            RunStatus::Completed
        };
        RunResult {
            run_id: self.run_id.clone(),
            status,
            results: ledger.results.clone(),
            suspended: ledger.suspended.clone(),
        }
    }
}

/// Overall outcome of a run once every branch has settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every step settled without failure or suspension
    Completed,
    /// At least one step failed
    Failed,
    /// At least one step waits for a resume
    Suspended,
}

/// What a start or resume call returns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    /// Run id
    pub run_id: String,
    /// Overall status
    pub status: RunStatus,
    /// Result of every step that recorded one
    pub results: BTreeMap<String, StepResult>,
    /// Suspended step id to owning branch
    pub suspended: BTreeMap<String, String>,
}

/// Handle on one run of a workflow
#[derive(Clone)]
pub struct WorkflowInstance {
    shared: Arc<RunShared>,
}

impl WorkflowInstance {
    pub(crate) fn new(
        workflow: Arc<WorkflowDef>,
        run_id: String,
        store: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            shared: Arc::new(RunShared {
                workflow,
                run_id,
                config,
                trigger_data: RwLock::new(Value::Null),
                ledger: Mutex::new(Ledger::default()),
                branches: Mutex::new(BTreeMap::new()),
                store,
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Run id
    pub fn run_id(&self) -> &str {
        &self.shared.run_id
    }

    /// Results recorded so far
    pub fn results(&self) -> BTreeMap<String, StepResult> {
        self.shared.results()
    }

    /// Run the top-level chains until every branch settles
    pub async fn start(&self, trigger_data: Value) -> WorkflowResult<RunResult> {
        let shared = &self.shared;
        *shared.trigger_data.write() = trigger_data;
        tracing::info!(workflow = %shared.workflow.name, run_id = %shared.run_id, "workflow run started");
        run_branch(shared.clone(), ROOT_BRANCH.to_string(), None).await?;
        let result = shared.result();
        tracing::info!(
            workflow = %shared.workflow.name,
            run_id = %shared.run_id,
            status = ?result.status,
            "workflow run settled"
        );
        Ok(result)
    }

    /// Resume a suspended step with a payload
    ///
    /// The step's result becomes its suspend payload merged with `payload`,
    /// the owning branch is restored with the step back in `pending`, and the
    /// handler sees `payload` through `StepContext::resume_payload`.
    pub async fn resume(&self, step_id: &str, payload: Value) -> WorkflowResult<RunResult> {
        let shared = &self.shared;
        let name = shared.workflow.name.clone();
        let state = shared
            .store
            .load(&name, &shared.run_id)
            .await?
            .ok_or_else(|| WorkflowError::RunNotFound {
                workflow: name.clone(),
                run_id: shared.run_id.clone(),
            })?;
        let branch = state
            .suspended_steps
            .get(step_id)
            .cloned()
            .ok_or_else(|| WorkflowError::NotSuspended(step_id.to_string()))?;
        let persisted = state
            .branch(&branch)
            .cloned()
            .ok_or_else(|| WorkflowError::MissingBranch(branch.clone()))?;
        let graph = shared
            .workflow
            .branch(&branch)
            .ok_or_else(|| WorkflowError::MissingBranch(branch.clone()))?;
        let target = pending_target(graph, step_id).ok_or_else(|| WorkflowError::NotSuspended(step_id.to_string()))?;
        shared.hydrate(&state);

        let machine = compile_branch(shared, &branch, graph)?;
        let mut patched = persisted;
        patched.value = machine.force_state(&patched.value, &target)?;
        let result = shared.mark_resumed(step_id, &payload);
        if let Some(steps) = patched.context.get_mut("steps").and_then(Value::as_object_mut) {
            steps.insert(step_id.to_string(), serde_json::to_value(&result).unwrap_or(Value::Null));
        }
        patched.status = SnapshotStatus::Active;
        patched.output = None;
        patched.error = None;

        tracing::info!(workflow = %name, run_id = %shared.run_id, step = %step_id, branch = %branch, "resuming step");
        shared.persist_branch(&branch, patched.clone()).await;
        run_branch(shared.clone(), branch, Some(patched)).await?;
        Ok(shared.result())
    }

    /// Deliver `event` to the step created by `after_event`
    pub async fn resume_with_event(&self, event: &str, data: Value) -> WorkflowResult<RunResult> {
        self.resume(&format!("__{event}_event"), json!({ "resumedEvent": data })).await
    }

    /// Write the last known state of every branch to the store
    pub async fn persist(&self) -> WorkflowResult<()> {
        self.shared.save().await
    }

    /// Stored record of this run
    pub async fn state(&self) -> WorkflowResult<Option<WorkflowRunState>> {
        Ok(self.shared.store.load(&self.shared.workflow.name, &self.shared.run_id).await?)
    }
}

impl std::fmt::Debug for WorkflowInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowInstance")
            .field("workflow", &self.shared.workflow.name)
            .field("run_id", &self.shared.run_id)
            .finish()
    }
}
