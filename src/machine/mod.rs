//! Statecharts as actor logic
//!
//! `StateMachine::new` compiles a `MachineConfig` against an
//! `Implementations` table into an immutable node arena. The machine is then
//! plugged into the actor runtime through `ActorLogic`: every processed event
//! runs one macrostep on a working copy of the snapshot.

use std::collections::BTreeSet;

use serde_json::Value;

pub mod action;
mod algorithm;
pub mod config;
pub mod node;
pub mod value;

pub use action::{Action, Delay, Guard, Source};
pub use config::{
    HistoryKind, Implementations, InvokeConfig, MachineConfig, StateConfig, StateKind,
    TransitionConfig,
};
pub use node::{Graph, NodeId, StateNode};

use crate::runtime::actor::{ActorLogic, ActorScope};
use crate::runtime::error::{ActorError, ActorResult, MachineResult};
use crate::runtime::event::Event;
use crate::runtime::snapshot::{PersistedSnapshot, Snapshot, SnapshotStatus, actor_references};
use action::ValueFn;
use algorithm::Step;
use config::ContextInit;

/// A compiled statechart
pub struct StateMachine {
    id: String,
    graph: Graph,
    context: ContextInit,
    output: Option<ValueFn>,
}

impl StateMachine {
    /// Compile a machine; every name must resolve
    pub fn new(config: MachineConfig, implementations: Implementations) -> MachineResult<Self> {
        let graph = node::compile(&config, &implementations)?;
        tracing::debug!(machine = %config.id, nodes = graph.len(), "compiled state machine");
        Ok(Self {
            id: config.id,
            graph,
            context: config.context,
            output: config.output,
        })
    }

    /// Machine id, also the id of the root node
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The compiled definition graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Node by id, `#id`, or `#id.child.path`
    pub fn node(&self, id: &str) -> Option<&StateNode> {
        self.graph.find(id).map(|node| self.graph.node(node))
    }

    /// Active node set of a state value
    pub fn resolve_value(&self, value: &Value) -> MachineResult<BTreeSet<NodeId>> {
        self.graph.resolve_value(value)
    }

    /// State value of an active node set
    pub fn state_value(&self, nodes: &BTreeSet<NodeId>) -> Value {
        self.graph.state_value(nodes)
    }

    /// Rewrite `value` so that `target` is active with its default descendants
    pub fn force_state(&self, value: &Value, target: &str) -> MachineResult<Value> {
        self.graph.force_state(value, target)
    }

    fn spawn_missing_invocations(&self, snapshot: &mut Snapshot, scope: &mut ActorScope<'_>) -> MachineResult<()> {
        let config = self.graph.resolve_value(&snapshot.value)?;
        let event = Event::init(Value::Null);
        for &active in &config {
            for invocation in &self.graph.node(active).invokes {
                if snapshot.children.contains_key(&invocation.id) {
                    continue;
                }
                let input = invocation
                    .input
                    .as_ref()
                    .map_or(Value::Null, |input| input(&snapshot.context, &event));
                let child = scope.spawn_child(
                    &invocation.id,
                    &invocation.src,
                    invocation.logic.clone(),
                    input,
                    invocation.system_id.clone(),
                );
                tracing::debug!(machine = %self.id, child = %invocation.id, "respawned invocation");
                snapshot.children.insert(invocation.id.clone(), child);
            }
        }
        Ok(())
    }
}

impl ActorLogic for StateMachine {
    fn initial_snapshot(&self, scope: &mut ActorScope<'_>, input: Value) -> ActorResult<Snapshot> {
        let context = match &self.context {
            ContextInit::Value(context) => context.clone(),
            ContextInit::FromInput(build) => build(&input),
        };
        let event = Event::init(input);
        let mut step = Step::initial(&self.graph, self.output.as_ref(), scope, context);
        step.enter_initial(&event)?;
        Ok(step.into_snapshot())
    }

    fn transition(
        &self,
        snapshot: &Snapshot,
        event: &Event,
        scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot> {
        if snapshot.status != SnapshotStatus::Active {
            return Ok(snapshot.clone());
        }
        let mut step = Step::resume(&self.graph, self.output.as_ref(), scope, snapshot)?;
        step.macrostep(event)?;
        Ok(step.into_snapshot())
    }

    fn restore_snapshot(
        &self,
        persisted: &PersistedSnapshot,
        scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot> {
        let self_id = scope.self_ref().id().to_string();
        let mut snapshot = Snapshot::from(persisted);
        let config = self.graph.resolve_value(&snapshot.value)?;
        snapshot.value = self.graph.state_value(&config);
        snapshot.tags = algorithm::tags(&self.graph, &config);

        let mut missing = Vec::new();
        for (id, child) in &persisted.children {
            match self.graph.sources.get(&child.src) {
                Some(logic) => {
                    let restored = scope.restore_child(id, &child.src, logic.clone(), child.snapshot.clone());
                    snapshot.children.insert(id.clone(), restored);
                }
                None => missing.push(format!("unknown actor source '{}' for child '{id}'", child.src)),
            }
        }
        for reference in actor_references(&snapshot.context) {
            if !snapshot.children.contains_key(&reference) {
                missing.push(format!("context refers to missing child '{reference}'"));
            }
        }
        if let Some(detail) = missing.into_iter().next() {
            return Err(ActorError::Restore { id: self_id, detail });
        }

        if snapshot.status == SnapshotStatus::Active {
            self.spawn_missing_invocations(&mut snapshot, scope)?;
        }
        tracing::debug!(machine = %self.id, children = snapshot.children.len(), "restored state machine");
        Ok(snapshot)
    }
}
