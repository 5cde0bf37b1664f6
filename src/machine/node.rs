//! Compiled state node arena
//!
//! Nodes are stored in pre-order, so a `NodeId` doubles as the document
//! order used for every ancestor, descendant and entry-order tie-break.
//! All names are resolved here; the algorithm never sees `Named` actions,
//! guards or delays.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::action::{Action, Delay, Guard, Source, ValueFn};
use super::config::{
    HistoryKind, Implementations, InvokeConfig, MachineConfig, StateConfig, StateKind,
    TransitionConfig,
};
use crate::runtime::actor::ActorLogic;
use crate::runtime::error::{MachineError, MachineResult};
use crate::runtime::event::{self, DONE_ACTOR, ERROR_ACTOR};

/// Index of a node in document order
pub type NodeId = usize;
/// Index of a transition in the arena
pub type TransitionId = usize;

const MAX_ALIAS_DEPTH: usize = 8;

/// A compiled state node
pub struct StateNode {
    /// Unique id; the dotted path from the root unless configured
    pub id: String,
    /// Key within the parent
    pub key: String,
    /// Node kind
    pub kind: StateKind,
    /// History depth for history nodes
    pub history: Option<HistoryKind>,
    /// Parent node
    pub parent: Option<NodeId>,
    /// Children in document order
    pub children: Vec<NodeId>,
    /// Distance from the root
    pub depth: usize,
    /// Tags carried while active
    pub tags: Vec<String>,
    pub(crate) initial: Option<TransitionId>,
    pub(crate) entry: Vec<Action>,
    pub(crate) exit: Vec<Action>,
    pub(crate) invokes: Vec<Invocation>,
    pub(crate) on: Vec<(String, Vec<TransitionId>)>,
    pub(crate) always: Vec<TransitionId>,
    pub(crate) delays: Vec<(Duration, String)>,
    pub(crate) history_default: Option<TransitionId>,
    pub(crate) output: Option<ValueFn>,
}

impl StateNode {
    /// Whether the node can be a leaf of a configuration
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }
}

/// A compiled transition
pub struct Transition {
    /// Owning node
    pub source: NodeId,
    /// Resolved targets; empty for targetless transitions
    pub targets: Vec<NodeId>,
    /// Descriptor the transition is registered under
    pub event_type: String,
    /// Exit and re-enter the source for self-targeting transitions
    pub reenter: bool,
    pub(crate) guard: Option<Guard>,
    pub(crate) actions: Vec<Action>,
}

pub(crate) struct Invocation {
    pub(crate) id: String,
    pub(crate) src: String,
    pub(crate) logic: Arc<dyn ActorLogic>,
    pub(crate) input: Option<ValueFn>,
    pub(crate) system_id: Option<String>,
}

/// The immutable definition graph of a machine
pub struct Graph {
    pub(crate) nodes: Vec<StateNode>,
    pub(crate) transitions: Vec<Transition>,
    pub(crate) ids: HashMap<String, NodeId>,
    pub(crate) sources: HashMap<String, Arc<dyn ActorLogic>>,
}

/// The root node
pub const ROOT: NodeId = 0;

impl Graph {
    /// Node by index
    pub fn node(&self, id: NodeId) -> &StateNode {
        &self.nodes[id]
    }

    /// Transition by index
    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id]
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; a graph has at least its root
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look a node up by id, `#id`, or `#id.child.path`
    pub fn find(&self, reference: &str) -> Option<NodeId> {
        let reference = reference.strip_prefix('#').unwrap_or(reference);
        if let Some(&node) = self.ids.get(reference) {
            return Some(node);
        }
        for (split, _) in reference.match_indices('.').rev() {
            if let Some(&node) = self.ids.get(&reference[..split]) {
                return self.descend(node, &reference[split + 1..]);
            }
        }
        None
    }

    fn descend(&self, from: NodeId, path: &str) -> Option<NodeId> {
        path.split('.').try_fold(from, |node, key| {
            self.nodes[node]
                .children
                .iter()
                .copied()
                .find(|&child| self.nodes[child].key == key)
        })
    }

    /// Whether `node` is a strict descendant of `ancestor`
    pub fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> bool {
        let mut current = self.nodes[node].parent;
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.nodes[parent].parent;
        }
        false
    }

    /// Ancestors of `node` from its parent upwards, stopping before `stop`
    pub fn proper_ancestors(&self, node: NodeId, stop: Option<NodeId>) -> Vec<NodeId> {
        let mut ancestors = Vec::new();
        let mut current = self.nodes[node].parent;
        while let Some(parent) = current {
            if Some(parent) == stop {
                break;
            }
            ancestors.push(parent);
            current = self.nodes[parent].parent;
        }
        ancestors
    }

    /// Ordered transitions of `node` that match `event_type`
    ///
    /// An exact descriptor wins outright. Otherwise wildcard descriptors are
    /// tried from the most specific (longest) to the least, keeping
    /// declaration order among equally specific ones.
    pub fn candidates(&self, node: NodeId, event_type: &str) -> Vec<TransitionId> {
        let on = &self.nodes[node].on;
        if let Some((_, exact)) = on.iter().find(|(descriptor, _)| descriptor == event_type) {
            return exact.clone();
        }
        let mut partial: Vec<&(String, Vec<TransitionId>)> = on
            .iter()
            .filter(|(descriptor, _)| descriptor_matches(descriptor, event_type))
            .collect();
        partial.sort_by_key(|(descriptor, _)| Reverse(descriptor.len()));
        partial.into_iter().flat_map(|(_, ids)| ids.iter().copied()).collect()
    }
}

/// Token-wise match of a wildcard descriptor (`*` or `prefix.*`)
pub fn descriptor_matches(descriptor: &str, event_type: &str) -> bool {
    if descriptor == "*" {
        return true;
    }
    let Some(prefix) = descriptor.strip_suffix(".*") else {
        return descriptor == event_type;
    };
    let mut tokens = event_type.split('.');
    prefix
        .split('.')
        .all(|expected| tokens.next() == Some(expected))
}

fn validate_descriptor(descriptor: &str) -> MachineResult<()> {
    let wildcards = descriptor.matches('*').count();
    let legal = wildcards == 0
        || descriptor == "*"
        || (wildcards == 1 && descriptor.ends_with(".*"));
    if descriptor.is_empty() || !legal {
        return Err(MachineError::Configuration(format!(
            "invalid event descriptor '{descriptor}'"
        )));
    }
    Ok(())
}

enum Slot {
    On(String),
    Always,
    Initial,
    HistoryDefault,
}

struct Pending {
    source: NodeId,
    slot: Slot,
    config: TransitionConfig,
}

struct Builder<'a> {
    impls: &'a Implementations,
    graph: Graph,
    pending: Vec<Pending>,
}

/// Compile a configuration into its node arena
pub(crate) fn compile(config: &MachineConfig, impls: &Implementations) -> MachineResult<Graph> {
    let mut builder = Builder {
        impls,
        graph: Graph {
            nodes: Vec::new(),
            transitions: Vec::new(),
            ids: HashMap::new(),
            sources: HashMap::new(),
        },
        pending: Vec::new(),
    };
    builder.add_node(&config.id, &config.id, None, &config.root)?;
    builder.resolve_pending()?;
    Ok(builder.graph)
}

impl Builder<'_> {
    fn add_node(
        &mut self,
        key: &str,
        path: &str,
        parent: Option<NodeId>,
        config: &StateConfig,
    ) -> MachineResult<NodeId> {
        if key.is_empty() || key.contains('.') || key.starts_with('#') {
            return Err(MachineError::Configuration(format!("invalid state key '{key}'")));
        }
        let kind = config.kind.unwrap_or(if config.states.is_empty() {
            StateKind::Atomic
        } else {
            StateKind::Compound
        });
        let leaf_kind = matches!(kind, StateKind::Atomic | StateKind::Final | StateKind::History);
        if leaf_kind && !config.states.is_empty() {
            return Err(MachineError::Configuration(format!(
                "state '{path}' of kind {kind:?} cannot have children"
            )));
        }
        if matches!(kind, StateKind::Compound | StateKind::Parallel) && config.states.is_empty() {
            return Err(MachineError::Configuration(format!("state '{path}' has no children")));
        }
        if kind == StateKind::History && parent.is_none() {
            return Err(MachineError::Configuration("the root cannot be a history node".into()));
        }

        let node = self.graph.nodes.len();
        let id = config.id.clone().unwrap_or_else(|| path.to_string());
        self.register_id(&id, node)?;
        if id != path {
            self.register_id(path, node)?;
        }

        let depth = parent.map_or(0, |parent| self.graph.nodes[parent].depth + 1);
        let entry = self.resolve_actions(&config.entry)?;
        let exit = self.resolve_actions(&config.exit)?;

        let mut delays = Vec::new();
        for (delay, transition) in &config.after {
            let duration = self.resolve_delay(delay)?;
            let event_type = event::after_type(duration.as_millis() as u64, &id);
            delays.push((duration, event_type.clone()));
            self.push_pending(node, Slot::On(event_type), transition);
        }
        for (descriptor, transition) in &config.on {
            validate_descriptor(descriptor)?;
            self.push_pending(node, Slot::On(descriptor.clone()), transition);
        }
        for transition in &config.on_done {
            self.push_pending(node, Slot::On(format!("{}{id}", event::DONE_STATE)), transition);
        }
        for transition in &config.always {
            self.push_pending(node, Slot::Always, transition);
        }
        if let Some(default) = &config.history_default {
            self.push_pending(node, Slot::HistoryDefault, default);
        }
        if kind == StateKind::Compound {
            let initial = match &config.initial {
                Some(initial) => initial.clone(),
                None => config
                    .states
                    .iter()
                    .find(|(_, child)| child.kind != Some(StateKind::History))
                    .map(|(key, _)| key.clone())
                    .unwrap_or_default(),
            };
            let transition = TransitionConfig {
                targets: vec![format!(".{initial}")],
                actions: config.initial_actions.clone(),
                ..TransitionConfig::default()
            };
            self.push_pending(node, Slot::Initial, &transition);
        }
        let invokes = config
            .invoke
            .iter()
            .enumerate()
            .map(|(index, invoke)| self.resolve_invoke(node, &id, index, invoke))
            .collect::<MachineResult<Vec<_>>>()?;

        self.graph.nodes.push(StateNode {
            id,
            key: key.to_string(),
            kind,
            history: config.history,
            parent,
            children: Vec::new(),
            depth,
            tags: config.tags.clone(),
            initial: None,
            entry,
            exit,
            invokes,
            on: Vec::new(),
            always: Vec::new(),
            delays,
            history_default: None,
            output: config.output.clone(),
        });

        for (child_key, child) in &config.states {
            let child_path = format!("{path}.{child_key}");
            let child_id = self.add_node(child_key, &child_path, Some(node), child)?;
            self.graph.nodes[node].children.push(child_id);
        }
        Ok(node)
    }

    fn register_id(&mut self, id: &str, node: NodeId) -> MachineResult<()> {
        if self.graph.ids.insert(id.to_string(), node).is_some() {
            return Err(MachineError::Configuration(format!("duplicate state id '{id}'")));
        }
        Ok(())
    }

    fn push_pending(&mut self, source: NodeId, slot: Slot, config: &TransitionConfig) {
        self.pending.push(Pending {
            source,
            slot,
            config: config.clone(),
        });
    }

    fn resolve_invoke(
        &mut self,
        node: NodeId,
        state_id: &str,
        index: usize,
        invoke: &InvokeConfig,
    ) -> MachineResult<Invocation> {
        let id = invoke
            .id
            .clone()
            .unwrap_or_else(|| format!("{state_id}:invocation[{index}]"));
        let (src, logic) = self.resolve_source(&invoke.src)?;
        for transition in &invoke.on_done {
            self.push_pending(node, Slot::On(format!("{DONE_ACTOR}{id}")), transition);
        }
        for transition in &invoke.on_error {
            self.push_pending(node, Slot::On(format!("{ERROR_ACTOR}{id}")), transition);
        }
        Ok(Invocation {
            id,
            src,
            logic,
            input: invoke.input.clone(),
            system_id: invoke.system_id.clone(),
        })
    }

    fn resolve_source(&mut self, source: &Source) -> MachineResult<(String, Arc<dyn ActorLogic>)> {
        let (src, logic) = match source {
            Source::Named(name) => {
                let logic = self.impls.actors.get(name).cloned().ok_or_else(|| {
                    MachineError::Configuration(format!("unknown actor source '{name}'"))
                })?;
                (name.clone(), logic)
            }
            Source::Logic { src, logic } => (src.clone(), logic.clone()),
        };
        self.graph.sources.insert(src.clone(), logic.clone());
        Ok((src, logic))
    }

    fn resolve_delay(&self, delay: &Delay) -> MachineResult<Duration> {
        match delay {
            Delay::Fixed(duration) => Ok(*duration),
            Delay::Named(name) => self
                .impls
                .delays
                .get(name)
                .copied()
                .ok_or_else(|| MachineError::Configuration(format!("unknown delay '{name}'"))),
        }
    }

    fn resolve_actions(&mut self, actions: &[Action]) -> MachineResult<Vec<Action>> {
        actions.iter().map(|action| self.resolve_action(action, 0)).collect()
    }

    fn resolve_action(&mut self, action: &Action, depth: usize) -> MachineResult<Action> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(MachineError::Configuration("action aliases nest too deeply".into()));
        }
        let resolved = match action {
            Action::Named(name) => {
                let target = self.impls.actions.get(name).cloned().ok_or_else(|| {
                    MachineError::Configuration(format!("unknown action '{name}'"))
                })?;
                return self.resolve_action(&target, depth + 1);
            }
            Action::Raise { event, delay, id } => Action::Raise {
                event: event.clone(),
                delay: delay.as_ref().map(|d| self.resolve_delay(d).map(Delay::Fixed)).transpose()?,
                id: id.clone(),
            },
            Action::SendTo {
                target,
                event,
                delay,
                id,
            } => Action::SendTo {
                target: target.clone(),
                event: event.clone(),
                delay: delay.as_ref().map(|d| self.resolve_delay(d).map(Delay::Fixed)).transpose()?,
                id: id.clone(),
            },
            Action::Spawn {
                id,
                src,
                input,
                system_id,
                assign_to,
            } => {
                let (key, logic) = self.resolve_source(src)?;
                Action::Spawn {
                    id: id.clone(),
                    src: Source::Logic { src: key, logic },
                    input: input.clone(),
                    system_id: system_id.clone(),
                    assign_to: assign_to.clone(),
                }
            }
            other => other.clone(),
        };
        Ok(resolved)
    }

    fn resolve_guard(&self, guard: &Guard, depth: usize) -> MachineResult<Guard> {
        if depth > MAX_ALIAS_DEPTH {
            return Err(MachineError::Configuration("guard aliases nest too deeply".into()));
        }
        match guard {
            Guard::Named(name) => {
                let target = self.impls.guards.get(name).ok_or_else(|| {
                    MachineError::Configuration(format!("unknown guard '{name}'"))
                })?;
                self.resolve_guard(target, depth + 1)
            }
            Guard::Check { .. } => Ok(guard.clone()),
            Guard::Not(inner) => Ok(Guard::Not(Box::new(self.resolve_guard(inner, depth)?))),
            Guard::And(items) | Guard::Or(items) if items.is_empty() => Err(
                MachineError::Configuration(format!("empty logical guard '{}'", guard.name())),
            ),
            Guard::And(items) => Ok(Guard::And(self.resolve_guards(items, depth)?)),
            Guard::Or(items) => Ok(Guard::Or(self.resolve_guards(items, depth)?)),
            Guard::StateIn(reference) => match self.graph.find(reference) {
                Some(_) => Ok(guard.clone()),
                None => Err(MachineError::Configuration(format!(
                    "stateIn guard refers to unknown state '{reference}'"
                ))),
            },
        }
    }

    fn resolve_guards(&self, guards: &[Guard], depth: usize) -> MachineResult<Vec<Guard>> {
        guards.iter().map(|guard| self.resolve_guard(guard, depth)).collect()
    }

    fn resolve_target(&self, source: NodeId, target: &str) -> MachineResult<NodeId> {
        let found = if target.starts_with('#') {
            self.graph.find(target)
        } else if let Some(path) = target.strip_prefix('.') {
            self.graph.descend(source, path)
        } else {
            let base = self.graph.nodes[source].parent.unwrap_or(source);
            self.graph.descend(base, target)
        };
        found.ok_or_else(|| {
            MachineError::Configuration(format!(
                "target '{target}' of state '{}' does not exist",
                self.graph.nodes[source].id
            ))
        })
    }

    fn resolve_pending(&mut self) -> MachineResult<()> {
        for pending in std::mem::take(&mut self.pending) {
            let Pending { source, slot, config } = pending;
            let targets = config
                .targets
                .iter()
                .map(|target| self.resolve_target(source, target))
                .collect::<MachineResult<Vec<_>>>()?;
            let guard = config
                .guard
                .as_ref()
                .map(|guard| self.resolve_guard(guard, 0))
                .transpose()?;
            let actions = self.resolve_actions(&config.actions)?;

            let event_type = match &slot {
                Slot::On(descriptor) => descriptor.clone(),
                Slot::Always | Slot::Initial | Slot::HistoryDefault => String::new(),
            };
            if matches!(slot, Slot::Initial) {
                if targets.iter().any(|&target| !self.graph.is_descendant(target, source)) {
                    return Err(MachineError::Configuration(format!(
                        "initial state of '{}' must be a descendant",
                        self.graph.nodes[source].id
                    )));
                }
            }

            let transition = self.graph.transitions.len();
            self.graph.transitions.push(Transition {
                source,
                targets,
                event_type: event_type.clone(),
                reenter: config.reenter,
                guard,
                actions,
            });

            let node = &mut self.graph.nodes[source];
            match slot {
                Slot::On(descriptor) => match node.on.iter_mut().find(|(d, _)| *d == descriptor) {
                    Some((_, list)) => list.push(transition),
                    None => node.on.push((descriptor, vec![transition])),
                },
                Slot::Always => node.always.push(transition),
                Slot::Initial => node.initial = Some(transition),
                Slot::HistoryDefault => node.history_default = Some(transition),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::config::TransitionConfig;

    fn graph(root: StateConfig) -> MachineResult<Graph> {
        compile(&MachineConfig::new("m", root), &Implementations::new())
    }

    #[test]
    fn test_ids_follow_document_order() {
        let graph = graph(
            StateConfig::compound("a")
                .state("a", StateConfig::compound("x").state("x", StateConfig::atomic()))
                .state("b", StateConfig::atomic().id("custom")),
        )
        .unwrap();
        assert_eq!(graph.find("m.a.x"), Some(2));
        assert_eq!(graph.find("#custom"), Some(3));
        assert_eq!(graph.find("#m.b"), Some(3));
        assert_eq!(graph.find("#m.a.missing"), None);
        assert!(graph.is_descendant(2, 1));
        assert_eq!(graph.proper_ancestors(2, None), vec![1, 0]);
    }

    #[test]
    fn test_exact_descriptor_beats_wildcards() {
        let graph = graph(
            StateConfig::compound("a").state(
                "a",
                StateConfig::atomic()
                    .on("*", TransitionConfig::internal())
                    .on("error.*", TransitionConfig::internal())
                    .on("error.actor.*", TransitionConfig::internal())
                    .on("error.actor.x", TransitionConfig::internal()),
            ),
        )
        .unwrap();
        let a = graph.find("m.a").unwrap();
        let exact = graph.candidates(a, "error.actor.x");
        assert_eq!(exact.len(), 1);
        assert_eq!(graph.transition(exact[0]).event_type, "error.actor.x");

        let partial: Vec<_> = graph
            .candidates(a, "error.actor.y")
            .into_iter()
            .map(|t| graph.transition(t).event_type.clone())
            .collect();
        assert_eq!(partial, vec!["error.actor.*", "error.*", "*"]);
        assert!(!descriptor_matches("error.*", "errors.x"));
    }

    #[test]
    fn test_unknown_names_are_rejected() {
        let missing_target = graph(
            StateConfig::compound("a").state("a", StateConfig::atomic().on("GO", TransitionConfig::to("nowhere"))),
        );
        assert!(matches!(missing_target, Err(MachineError::Configuration(_))));

        let missing_guard = graph(StateConfig::compound("a").state(
            "a",
            StateConfig::atomic().on("GO", TransitionConfig::internal().guard(Guard::named("ready"))),
        ));
        assert!(matches!(missing_guard, Err(MachineError::Configuration(_))));

        let empty_and = graph(StateConfig::compound("a").state(
            "a",
            StateConfig::atomic().on("GO", TransitionConfig::internal().guard(Guard::And(vec![]))),
        ));
        assert!(matches!(empty_and, Err(MachineError::Configuration(_))));

        let bad_initial = graph(StateConfig::compound("zzz").state("a", StateConfig::atomic()));
        assert!(matches!(bad_initial, Err(MachineError::Configuration(_))));

        let bad_descriptor = graph(
            StateConfig::compound("a").state("a", StateConfig::atomic().on("a.*.b", TransitionConfig::internal())),
        );
        assert!(matches!(bad_descriptor, Err(MachineError::Configuration(_))));
    }

    #[test]
    fn test_after_and_invoke_compile_to_reserved_events() {
        let logic: Arc<dyn ActorLogic> = Arc::new(crate::runtime::logic::ReducerLogic::new(
            serde_json::Value::Null,
            |state, _| state.clone(),
        ));
        let graph = graph(
            StateConfig::compound("a").state(
                "a",
                StateConfig::atomic()
                    .after(Duration::from_millis(250), TransitionConfig::internal())
                    .invoke(InvokeConfig::logic("worker", logic).on_done(TransitionConfig::internal())),
            ),
        )
        .unwrap();
        let a = graph.node(graph.find("m.a").unwrap());
        let descriptors: Vec<_> = a.on.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(descriptors, vec!["after.250.m.a", "done.actor.m.a:invocation[0]"]);
        assert!(graph.sources.contains_key("worker"));
    }
}
