//! The workflow builder and step graph
//!
//! A workflow is a set of chains. Top-level chains run in parallel when the
//! run starts; subscriber chains run when the steps they are keyed on have
//! finished. `if_`, `while_`, `until` and `after_event` lower into synthetic
//! steps wired through the same subscriber mechanism.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::json;

use super::condition::{ConditionEvaluator, QueryEvaluator, StepCondition};
use super::instance::WorkflowInstance;
use super::step::{Step, StepOptions, UnmetPolicy};
use super::store::SnapshotStore;
use crate::runtime::RuntimeConfig;
use crate::runtime::error::{WorkflowError, WorkflowResult};

/// Sub-state names of a step; step ids may not reuse them
pub const RESERVED_STATES: [&str; 8] = [
    "pending",
    "waiting",
    "executing",
    "runningSubscribers",
    "completed",
    "failed",
    "suspended",
    "limbo",
];

/// Separator of compound dependency keys
pub const KEY_SEPARATOR: &str = "&&";

/// A step placed in the graph with its options
#[derive(Clone, Debug)]
pub struct StepNode {
    pub(crate) step: Step,
    pub(crate) options: StepOptions,
    pub(crate) synthetic: bool,
}

impl StepNode {
    /// Id of the placed step
    pub fn id(&self) -> &str {
        self.step.id()
    }

    /// Whether the builder generated this step
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

/// Parallel chains of steps
#[derive(Clone, Debug, Default)]
pub struct StepGraph {
    pub(crate) chains: Vec<Vec<StepNode>>,
}

impl StepGraph {
    /// First step of every chain
    pub fn roots(&self) -> impl Iterator<Item = &StepNode> {
        self.chains.iter().filter_map(|chain| chain.first())
    }

    /// All chains in declaration order
    pub fn chains(&self) -> &[Vec<StepNode>] {
        &self.chains
    }

    /// Chain prefix ending at `step_id`
    pub(crate) fn path_to(&self, step_id: &str) -> Option<Vec<&str>> {
        self.chains.iter().find_map(|chain| {
            let index = chain.iter().position(|node| node.id() == step_id)?;
            Some(chain[..=index].iter().map(StepNode::id).collect())
        })
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = &StepNode> {
        self.chains.iter().flatten()
    }
}

pub(crate) struct WorkflowDef {
    pub(crate) name: String,
    pub(crate) graph: StepGraph,
    pub(crate) subscribers: BTreeMap<String, StepGraph>,
    pub(crate) evaluator: Arc<dyn ConditionEvaluator>,
}

impl WorkflowDef {
    /// Step graph run for a branch key; the root key selects the top-level graph
    pub(crate) fn branch(&self, key: &str) -> Option<&StepGraph> {
        if key == ROOT_BRANCH {
            Some(&self.graph)
        } else {
            self.subscribers.get(key)
        }
    }

    /// Subscriber keys that mention `step_id`
    pub(crate) fn subscriber_keys(&self, step_id: &str) -> Vec<String> {
        self.subscribers
            .keys()
            .filter(|key| key.split(KEY_SEPARATOR).any(|part| part == step_id))
            .cloned()
            .collect()
    }
}

/// Branch key of the top-level graph
pub const ROOT_BRANCH: &str = "root";

/// A committed, immutable workflow
#[derive(Clone)]
pub struct Workflow {
    pub(crate) def: Arc<WorkflowDef>,
}

impl Workflow {
    /// Start building a workflow
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name.into())
    }

    /// Workflow name
    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Top-level chains
    pub fn step_graph(&self) -> &StepGraph {
        &self.def.graph
    }

    /// Subscriber chains keyed by dependency key
    pub fn subscribers(&self) -> &BTreeMap<String, StepGraph> {
        &self.def.subscribers
    }

    /// New run with a fresh id
    pub fn create_run(&self, store: Arc<dyn SnapshotStore>) -> WorkflowInstance {
        self.run_with_id(uuid::Uuid::new_v4().to_string(), store, RuntimeConfig::default())
    }

    /// Handle on a run by id, new or persisted
    pub fn run_with_id(
        &self,
        run_id: impl Into<String>,
        store: Arc<dyn SnapshotStore>,
        config: RuntimeConfig,
    ) -> WorkflowInstance {
        WorkflowInstance::new(self.def.clone(), run_id.into(), store, config)
    }
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.def.name)
            .field("graph", &self.def.graph)
            .field("subscribers", &self.def.subscribers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Fluent builder; errors accumulate and surface from `commit`
pub struct WorkflowBuilder {
    name: String,
    graph: StepGraph,
    subscribers: BTreeMap<String, StepGraph>,
    scope: Option<String>,
    last: Option<String>,
    last_if: Option<(String, StepCondition)>,
    declared: BTreeSet<String>,
    evaluator: Arc<dyn ConditionEvaluator>,
    errors: Vec<String>,
}

impl WorkflowBuilder {
    fn new(name: String) -> Self {
        Self {
            name,
            graph: StepGraph::default(),
            subscribers: BTreeMap::new(),
            scope: None,
            last: None,
            last_if: None,
            declared: BTreeSet::new(),
            evaluator: Arc::new(QueryEvaluator),
            errors: Vec::new(),
        }
    }

    /// Start a new parallel chain
    pub fn step(self, step: Step) -> Self {
        self.step_with(step, StepOptions::default())
    }

    /// Start a new parallel chain with options
    pub fn step_with(mut self, step: Step, options: StepOptions) -> Self {
        self.place(StepNode { step, options, synthetic: false }, false);
        self
    }

    /// Continue the current chain
    pub fn then(self, step: Step) -> Self {
        self.then_with(step, StepOptions::default())
    }

    /// Continue the current chain with options
    pub fn then_with(mut self, step: Step, options: StepOptions) -> Self {
        self.place(StepNode { step, options, synthetic: false }, true);
        self
    }

    /// Following chains run once `step_id` has finished
    pub fn after(mut self, step_id: &str) -> Self {
        self.scope = Some(step_id.to_string());
        self.last = None;
        self
    }

    /// Following chains run once every listed step has finished
    pub fn after_all(mut self, step_ids: &[&str]) -> Self {
        if step_ids.is_empty() {
            self.errors.push("after_all needs at least one step".into());
            return self;
        }
        self.scope = Some(step_ids.join(KEY_SEPARATOR));
        self.last = None;
        self
    }

    /// Following chains run only when `condition` holds after the last step
    pub fn if_(mut self, condition: StepCondition) -> Self {
        let Some(anchor) = self.last.clone() else {
            self.errors.push("if_ needs a preceding step".into());
            return self;
        };
        let id = format!("__{anchor}_if");
        self.scope = Some(anchor.clone());
        self.place(branch_step(id.clone(), condition.clone()), false);
        self.last_if = Some((anchor, condition));
        self.scope = Some(id);
        self.last = None;
        self
    }

    /// Following chains run only when the last `if_` condition does not hold
    pub fn else_(mut self) -> Self {
        let Some((anchor, condition)) = self.last_if.take() else {
            self.errors.push("else_ without a matching if_".into());
            return self;
        };
        let id = format!("__{anchor}_else");
        self.scope = Some(anchor);
        self.place(branch_step(id.clone(), StepCondition::not(condition)), false);
        self.scope = Some(id);
        self.last = None;
        self
    }

    /// Run `body` repeatedly while `condition` holds
    pub fn while_(self, condition: StepCondition, body: Step) -> Self {
        self.looping(LoopKind::While, condition, body)
    }

    /// Run `body` repeatedly until `condition` holds
    pub fn until(self, condition: StepCondition, body: Step) -> Self {
        self.looping(LoopKind::Until, condition, body)
    }

    fn looping(mut self, kind: LoopKind, condition: StepCondition, body: Step) -> Self {
        let body_id = body.id().to_string();
        let check_id = format!("__{body_id}_{}_check", kind.name());
        let finished_id = format!("__{body_id}_{}_finished", kind.name());
        let check = loop_check(check_id.clone(), kind, condition);

        self.place(check.clone(), true);

        let status_is = |status: &str| StepCondition::step(&check_id, "status", super::condition::Predicate::eq(status));
        self.scope = Some(check_id.clone());
        self.place(
            StepNode {
                step: body,
                options: StepOptions::new().when(status_is("continue")).on_unmet(UnmetPolicy::Limbo),
                synthetic: false,
            },
            false,
        );
        self.place(
            StepNode {
                step: Step::new(finished_id.clone(), |_| async { Ok(json!({"finished": true})) }),
                options: StepOptions::new().when(status_is("complete")).on_unmet(UnmetPolicy::Limbo),
                synthetic: true,
            },
            false,
        );
        self.scope = Some(body_id);
        self.place(check, false);

        self.scope = Some(finished_id);
        self.last = None;
        self
    }

    /// Pause the current chain until `event` is delivered through a resume
    pub fn after_event(mut self, event: &str) -> Self {
        let id = format!("__{event}_event");
        let name = event.to_string();
        let step = Step::new(id, move |ctx| {
            let name = name.clone();
            async move {
                if let Some(data) = ctx.resume_payload().and_then(|payload| payload.get("resumedEvent")) {
                    return Ok(json!({"executed": true, "resumedEvent": data}));
                }
                ctx.suspend(json!({"event": name})).await;
                Ok(json!({"executed": false}))
            }
        });
        self.place(StepNode { step, options: StepOptions::new(), synthetic: true }, true);
        self
    }

    /// Replace the predicate engine used by conditions
    pub fn evaluator(mut self, evaluator: Arc<dyn ConditionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Validate and freeze the workflow
    pub fn commit(mut self) -> WorkflowResult<Workflow> {
        if self.graph.chains.is_empty() {
            self.errors.push("workflow has no top-level steps".into());
        }
        for key in self.subscribers.keys() {
            for part in key.split(KEY_SEPARATOR) {
                if !self.declared.contains(part) {
                    self.errors.push(format!("subscriber key '{key}' refers to unknown step '{part}'"));
                }
            }
        }
        let nodes: Vec<&StepNode> = self
            .graph
            .nodes()
            .chain(self.subscribers.values().flat_map(StepGraph::nodes))
            .collect();
        for node in nodes {
            if let Some(condition) = &node.options.when {
                if let Err(err) = condition.validate() {
                    self.errors.push(format!("step '{}': {err}", node.id()));
                }
                for referenced in condition.referenced_steps() {
                    if !self.declared.contains(referenced) {
                        self.errors.push(format!(
                            "step '{}' has a condition on unknown step '{referenced}'",
                            node.id()
                        ));
                    }
                }
            }
            for (name, source) in &node.options.variables {
                if source.step != super::step::TRIGGER && !self.declared.contains(&source.step) {
                    self.errors.push(format!(
                        "variable '{name}' of step '{}' refers to unknown step '{}'",
                        node.id(),
                        source.step
                    ));
                }
            }
        }

        if !self.errors.is_empty() {
            return Err(WorkflowError::Configuration {
                workflow: self.name,
                detail: self.errors.join("; "),
            });
        }
        tracing::debug!(
            workflow = %self.name,
            chains = self.graph.chains.len(),
            subscribers = self.subscribers.len(),
            "committed workflow"
        );
        Ok(Workflow {
            def: Arc::new(WorkflowDef {
                name: self.name,
                graph: self.graph,
                subscribers: self.subscribers,
                evaluator: self.evaluator,
            }),
        })
    }

    fn place(&mut self, node: StepNode, chained: bool) {
        let id = node.id().to_string();
        if let Err(detail) = validate_step_id(&id) {
            self.errors.push(detail);
            return;
        }
        if !self.declared.insert(id.clone()) && !node.synthetic {
            self.errors.push(format!("duplicate step id '{id}'"));
            return;
        }

        let graph = match &self.scope {
            Some(key) => self.subscribers.entry(key.clone()).or_default(),
            None => &mut self.graph,
        };
        let extend = chained && self.last.is_some();
        match graph.chains.last_mut() {
            Some(chain) if extend => chain.push(node),
            _ => graph.chains.push(vec![node]),
        }
        self.last = Some(id);
    }
}

fn validate_step_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("step id must not be empty".into());
    }
    if RESERVED_STATES.contains(&id) || id == ROOT_BRANCH {
        return Err(format!("step id '{id}' is reserved"));
    }
    if id.contains('.') || id.contains('#') || id.contains(KEY_SEPARATOR) {
        return Err(format!("step id '{id}' must not contain '.', '#' or '{KEY_SEPARATOR}'"));
    }
    Ok(())
}

fn branch_step(id: String, condition: StepCondition) -> StepNode {
    StepNode {
        step: Step::new(id, |_| async { Ok(json!({"branch": true})) }),
        options: StepOptions::new().when(condition).on_unmet(UnmetPolicy::Limbo),
        synthetic: true,
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    While,
    Until,
}

impl LoopKind {
    fn name(self) -> &'static str {
        match self {
            LoopKind::While => "while",
            LoopKind::Until => "until",
        }
    }
}

fn loop_check(id: String, kind: LoopKind, condition: StepCondition) -> StepNode {
    let condition = Arc::new(condition);
    let step = Step::new(id, move |ctx| {
        let holds = ctx.evaluate(&condition);
        async move {
            let proceed = match kind {
                LoopKind::While => holds?,
                LoopKind::Until => !holds?,
            };
            let status = if proceed { "continue" } else { "complete" };
            Ok(json!({ "status": status }))
        }
    });
    StepNode {
        step,
        options: StepOptions::new(),
        synthetic: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::condition::Predicate;
    use serde_json::Value;

    fn noop(id: &str) -> Step {
        Step::new(id, |_| async { Ok(Value::Null) })
    }

    #[test]
    fn test_then_extends_chain_and_step_starts_new_one() {
        let workflow = Workflow::builder("w")
            .step(noop("a"))
            .then(noop("b"))
            .step(noop("c"))
            .commit()
            .unwrap();
        let chains: Vec<Vec<&str>> = workflow
            .step_graph()
            .chains()
            .iter()
            .map(|chain| chain.iter().map(StepNode::id).collect())
            .collect();
        assert_eq!(chains, vec![vec!["a", "b"], vec!["c"]]);
        assert_eq!(workflow.step_graph().path_to("b"), Some(vec!["a", "b"]));
    }

    #[test]
    fn test_after_all_uses_compound_key() {
        let workflow = Workflow::builder("w")
            .step(noop("a"))
            .step(noop("b"))
            .after_all(&["a", "b"])
            .step(noop("c"))
            .commit()
            .unwrap();
        assert!(workflow.subscribers().contains_key("a&&b"));
        assert_eq!(workflow.def.subscriber_keys("b"), vec!["a&&b".to_string()]);
    }

    #[test]
    fn test_if_else_creates_synthetic_steps() {
        let condition = StepCondition::step("a", "ok", Predicate::eq(true));
        let workflow = Workflow::builder("w")
            .step(noop("a"))
            .if_(condition)
            .then(noop("yes"))
            .else_()
            .then(noop("no"))
            .commit()
            .unwrap();
        let after_a: Vec<&str> = workflow.subscribers()["a"].roots().map(StepNode::id).collect();
        assert_eq!(after_a, vec!["__a_if", "__a_else"]);
        assert!(workflow.subscribers().contains_key("__a_if"));
        assert!(workflow.subscribers().contains_key("__a_else"));
    }

    #[test]
    fn test_loop_wires_check_body_and_finished() {
        let workflow = Workflow::builder("w")
            .step(noop("start"))
            .until(StepCondition::check(|_, _| Ok(true)), noop("poll"))
            .commit()
            .unwrap();
        let main: Vec<&str> = workflow.step_graph().chains()[0].iter().map(StepNode::id).collect();
        assert_eq!(main, vec!["start", "__poll_until_check"]);
        let after_check: Vec<&str> = workflow.subscribers()["__poll_until_check"]
            .roots()
            .map(StepNode::id)
            .collect();
        assert_eq!(after_check, vec!["poll", "__poll_until_finished"]);
        let after_body: Vec<&str> = workflow.subscribers()["poll"].roots().map(StepNode::id).collect();
        assert_eq!(after_body, vec!["__poll_until_check"]);
    }

    #[test]
    fn test_invalid_graphs_are_rejected() {
        let err = Workflow::builder("w").commit().unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration { .. }));

        let err = Workflow::builder("w")
            .step(noop("a"))
            .step(noop("a"))
            .after("ghost")
            .step(noop("pending"))
            .commit()
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("duplicate step id 'a'"));
        assert!(message.contains("unknown step 'ghost'"));
        assert!(message.contains("reserved"));

        let err = Workflow::builder("w")
            .step_with(noop("a"), StepOptions::new().when(StepCondition::Or(vec![])))
            .commit()
            .unwrap_err();
        assert!(err.to_string().contains("empty 'or'"));
    }
}
