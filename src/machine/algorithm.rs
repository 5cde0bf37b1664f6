//! Microstep and macrostep
//!
//! A `Step` holds the working copy of one snapshot while an event is
//! processed. Transitions are selected from the active leaves outwards,
//! conflicts are resolved, and each microstep exits, runs transition actions
//! and enters in that order. The macrostep then drains eventless transitions
//! and the internal queue until nothing more fires.
//!
//! Side effects never run here: sends, timers, child starts and effect
//! closures are queued on the `ActorScope` and flushed after the commit.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::iter;
use std::time::Duration;

use serde_json::Value;

use super::action::{Action, Delay, Guard, Source, ValueFn, merge_patch};
use super::config::{HistoryKind, StateKind};
use super::node::{Graph, NodeId, ROOT, TransitionId};
use crate::runtime::actor::{ActorScope, Effect};
use crate::runtime::error::{MachineError, MachineResult};
use crate::runtime::event::Event;
use crate::runtime::inspect::InspectionEvent;
use crate::runtime::snapshot::{Snapshot, SnapshotStatus, actor_reference};
use crate::runtime::ActorRef;

#[derive(Default)]
struct EntrySet {
    states: BTreeSet<NodeId>,
    default_entry: BTreeSet<NodeId>,
    history_actions: BTreeMap<NodeId, TransitionId>,
}

pub(crate) struct Step<'g, 's, 'a> {
    graph: &'g Graph,
    machine_output: Option<&'g ValueFn>,
    scope: &'s mut ActorScope<'a>,
    config: BTreeSet<NodeId>,
    context: Value,
    history: BTreeMap<NodeId, Vec<NodeId>>,
    children: BTreeMap<String, ActorRef>,
    internal: VecDeque<Event>,
    status: SnapshotStatus,
    output: Option<Value>,
    microsteps: usize,
    limit: usize,
}

impl<'g, 's, 'a> Step<'g, 's, 'a> {
    /// A step with nothing active yet
    pub(crate) fn initial(
        graph: &'g Graph,
        machine_output: Option<&'g ValueFn>,
        scope: &'s mut ActorScope<'a>,
        context: Value,
    ) -> Self {
        let limit = scope.system().config().max_microsteps;
        Self {
            graph,
            machine_output,
            scope,
            config: BTreeSet::new(),
            context,
            history: BTreeMap::new(),
            children: BTreeMap::new(),
            internal: VecDeque::new(),
            status: SnapshotStatus::Active,
            output: None,
            microsteps: 0,
            limit,
        }
    }

    /// A step continuing from a committed snapshot
    pub(crate) fn resume(
        graph: &'g Graph,
        machine_output: Option<&'g ValueFn>,
        scope: &'s mut ActorScope<'a>,
        snapshot: &Snapshot,
    ) -> MachineResult<Self> {
        let mut history = BTreeMap::new();
        for (id, recorded) in &snapshot.history_value {
            let node = find_node(graph, id)?;
            let recorded = recorded
                .iter()
                .map(|id| find_node(graph, id))
                .collect::<MachineResult<Vec<_>>>()?;
            history.insert(node, recorded);
        }
        let mut step = Self::initial(graph, machine_output, scope, snapshot.context.clone());
        step.config = graph.resolve_value(&snapshot.value)?;
        step.history = history;
        step.children = snapshot.children.clone();
        step.status = snapshot.status;
        step.output = snapshot.output.clone();
        Ok(step)
    }

    /// Enter the initial configuration and settle
    pub(crate) fn enter_initial(&mut self, event: &Event) -> MachineResult<()> {
        self.count_microstep()?;
        let mut entry = EntrySet::default();
        self.add_descendants(ROOT, &mut entry);
        self.enter(entry, event)?;
        self.finish_if_done(event)?;
        self.settle(event)
    }

    /// Process one external event to a fixpoint
    pub(crate) fn macrostep(&mut self, event: &Event) -> MachineResult<()> {
        if event.is_stop() {
            self.exit_all(event)?;
            self.status = SnapshotStatus::Stopped;
            return Ok(());
        }

        let transitions = self.select(Some(event), event)?;
        if transitions.is_empty() {
            if event.is_error() {
                return Err(MachineError::UnhandledError {
                    event: event.event_type().to_string(),
                    detail: event.error_message().unwrap_or_default(),
                });
            }
        } else {
            self.microstep(&transitions, event)?;
        }
        self.settle(event)
    }

    fn settle(&mut self, trigger: &Event) -> MachineResult<()> {
        let mut current = trigger.clone();
        while self.status == SnapshotStatus::Active {
            let eventless = self.select(None, &current)?;
            if !eventless.is_empty() {
                self.microstep(&eventless, &current)?;
                continue;
            }
            let Some(next) = self.internal.pop_front() else {
                break;
            };
            let transitions = self.select(Some(&next), &next)?;
            if !transitions.is_empty() {
                self.microstep(&transitions, &next)?;
            }
            current = next;
        }
        Ok(())
    }

    fn count_microstep(&mut self) -> MachineResult<()> {
        self.microsteps += 1;
        if self.microsteps > self.limit {
            return Err(MachineError::EventlessLoop { limit: self.limit });
        }
        Ok(())
    }

    fn select(&self, event: Option<&Event>, trigger: &Event) -> MachineResult<Vec<TransitionId>> {
        let graph = self.graph;
        let mut enabled = Vec::new();
        let leaves = self.config.iter().copied().filter(|&node| graph.node(node).is_atomic());
        for leaf in leaves {
            'walk: for node in iter::once(leaf).chain(graph.proper_ancestors(leaf, None)) {
                let candidates = match event {
                    Some(event) => graph.candidates(node, event.event_type()),
                    None => graph.node(node).always.clone(),
                };
                for transition in candidates {
                    if self.enabled(transition, trigger)? {
                        if !enabled.contains(&transition) {
                            enabled.push(transition);
                        }
                        break 'walk;
                    }
                }
            }
        }
        Ok(self.remove_conflicts(enabled, trigger))
    }

    fn enabled(&self, transition: TransitionId, event: &Event) -> MachineResult<bool> {
        let transition = self.graph.transition(transition);
        let Some(guard) = &transition.guard else {
            return Ok(true);
        };
        self.check(guard, event).map_err(|err| MachineError::GuardEvaluation {
            guard: guard.name(),
            event: event.event_type().to_string(),
            state: self.graph.node(transition.source).id.clone(),
            detail: format!("{err:#}"),
        })
    }

    fn check(&self, guard: &Guard, event: &Event) -> anyhow::Result<bool> {
        match guard {
            Guard::Check { check, .. } => check(&self.context, event),
            Guard::Not(inner) => Ok(!self.check(inner, event)?),
            Guard::And(items) => {
                for item in items {
                    if !self.check(item, event)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Guard::Or(items) => {
                for item in items {
                    if self.check(item, event)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Guard::StateIn(reference) => match self.graph.find(reference) {
                Some(node) => Ok(self.config.contains(&node)),
                None => anyhow::bail!("unknown state '{reference}'"),
            },
            Guard::Named(name) => anyhow::bail!("unresolved guard '{name}'"),
        }
    }

    fn remove_conflicts(&self, enabled: Vec<TransitionId>, trigger: &Event) -> Vec<TransitionId> {
        let graph = self.graph;
        let mut kept: Vec<(TransitionId, BTreeSet<NodeId>)> = Vec::new();
        for candidate in enabled {
            let exits = self.exit_set(candidate);
            let source = graph.transition(candidate).source;
            let mut preempted = false;
            let mut displaced = Vec::new();
            for (other, other_exits) in &kept {
                if exits.is_disjoint(other_exits) {
                    continue;
                }
                let other_source = graph.transition(*other).source;
                if graph.is_descendant(source, other_source) {
                    displaced.push(*other);
                } else {
                    if !graph.is_descendant(other_source, source) {
                        tracing::warn!(
                            event = trigger.event_type(),
                            kept = %self.describe(*other),
                            dropped = %self.describe(candidate),
                            "conflicting transitions of equal priority; keeping the first in document order"
                        );
                    }
                    preempted = true;
                    break;
                }
            }
            if !preempted {
                kept.retain(|(other, _)| !displaced.contains(other));
                kept.push((candidate, exits));
            }
        }
        kept.into_iter().map(|(transition, _)| transition).collect()
    }

    fn describe(&self, transition: TransitionId) -> String {
        let transition = self.graph.transition(transition);
        let source = &self.graph.node(transition.source).id;
        if transition.targets.is_empty() {
            return source.clone();
        }
        let targets: Vec<&str> = transition
            .targets
            .iter()
            .map(|&target| self.graph.node(target).id.as_str())
            .collect();
        format!("{source} -> {}", targets.join(", "))
    }

    fn effective_targets(&self, transition: TransitionId) -> Vec<NodeId> {
        let mut targets = Vec::new();
        for &target in &self.graph.transition(transition).targets {
            self.resolve_history(target, &mut targets);
        }
        targets
    }

    fn resolve_history(&self, node: NodeId, out: &mut Vec<NodeId>) {
        if self.graph.node(node).kind != StateKind::History {
            if !out.contains(&node) {
                out.push(node);
            }
            return;
        }
        match self.history.get(&node) {
            Some(recorded) => {
                for &stored in recorded {
                    if !out.contains(&stored) {
                        out.push(stored);
                    }
                }
            }
            None => {
                if let Some(default) = self.history_default(node) {
                    for &target in &self.graph.transition(default).targets {
                        self.resolve_history(target, out);
                    }
                }
            }
        }
    }

    fn history_default(&self, node: NodeId) -> Option<TransitionId> {
        let state = self.graph.node(node);
        state
            .history_default
            .or_else(|| state.parent.and_then(|parent| self.graph.node(parent).initial))
    }

    fn domain(&self, transition: TransitionId) -> Option<NodeId> {
        let graph = self.graph;
        let targets = self.effective_targets(transition);
        if targets.is_empty() {
            return None;
        }
        let definition = graph.transition(transition);
        let source = definition.source;
        let within_source = targets
            .iter()
            .all(|&target| target == source || graph.is_descendant(target, source));
        if !definition.reenter && graph.node(source).kind != StateKind::Parallel && within_source {
            return Some(source);
        }

        let (head, tail) = (targets[0], &targets[1..]);
        graph
            .proper_ancestors(head, None)
            .into_iter()
            .filter(|&ancestor| ancestor == ROOT || graph.node(ancestor).kind == StateKind::Compound)
            .find(|&ancestor| {
                tail.iter()
                    .chain(iter::once(&source))
                    .all(|&node| graph.is_descendant(node, ancestor))
            })
            .or(Some(ROOT))
    }

    fn exit_set(&self, transition: TransitionId) -> BTreeSet<NodeId> {
        if self.graph.transition(transition).targets.is_empty() {
            return BTreeSet::new();
        }
        let Some(domain) = self.domain(transition) else {
            return BTreeSet::new();
        };
        self.config
            .iter()
            .copied()
            .filter(|&node| self.graph.is_descendant(node, domain))
            .collect()
    }

    fn microstep(&mut self, transitions: &[TransitionId], event: &Event) -> MachineResult<()> {
        let graph = self.graph;
        self.count_microstep()?;
        let sources: Vec<String> = transitions
            .iter()
            .map(|&transition| graph.node(graph.transition(transition).source).id.clone())
            .collect();
        tracing::trace!(event = event.event_type(), transitions = ?sources, "microstep");
        let session = self.scope.self_ref().session_id();
        self.scope.inspect(InspectionEvent::MicrostepTaken {
            session,
            event: event.clone(),
            transitions: sources,
        });

        let mut exiting: Vec<NodeId> = transitions
            .iter()
            .flat_map(|&transition| self.exit_set(transition))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        exiting.sort_by_key(|&node| Reverse((graph.node(node).depth, node)));
        self.record_history(&exiting);
        for &node in &exiting {
            self.exit_node(node, event, true)?;
        }

        for &transition in transitions {
            self.run_actions(&graph.transition(transition).actions, event)?;
        }

        let entry = self.entry_set(transitions);
        self.enter(entry, event)?;
        self.finish_if_done(event)
    }

    fn record_history(&mut self, exiting: &[NodeId]) {
        let graph = self.graph;
        for &node in exiting {
            for &child in &graph.node(node).children {
                let Some(kind) = graph.node(child).history else {
                    continue;
                };
                let recorded = self
                    .config
                    .iter()
                    .copied()
                    .filter(|&active| match kind {
                        HistoryKind::Deep => {
                            graph.node(active).is_atomic() && graph.is_descendant(active, node)
                        }
                        HistoryKind::Shallow => graph.node(active).parent == Some(node),
                    })
                    .collect();
                self.history.insert(child, recorded);
            }
        }
    }

    fn exit_node(&mut self, node: NodeId, event: &Event, deactivate: bool) -> MachineResult<()> {
        let graph = self.graph;
        let state = graph.node(node);
        for (_, delayed) in &state.delays {
            self.scope.cancel(delayed.clone());
        }
        self.run_actions(&state.exit, event)?;
        for invocation in &state.invokes {
            if let Some(child) = self.children.remove(&invocation.id) {
                self.scope.stop_child(&child);
            }
        }
        if deactivate {
            self.config.remove(&node);
        }
        Ok(())
    }

    fn exit_all(&mut self, event: &Event) -> MachineResult<()> {
        let graph = self.graph;
        let mut active: Vec<NodeId> = self.config.iter().copied().collect();
        active.sort_by_key(|&node| Reverse((graph.node(node).depth, node)));
        for node in active {
            self.exit_node(node, event, false)?;
        }
        Ok(())
    }

    fn finish_if_done(&mut self, event: &Event) -> MachineResult<()> {
        if self.status == SnapshotStatus::Done {
            self.exit_all(event)?;
        }
        Ok(())
    }

    fn entry_set(&self, transitions: &[TransitionId]) -> EntrySet {
        let mut entry = EntrySet::default();
        for &transition in transitions {
            let targets = &self.graph.transition(transition).targets;
            if targets.is_empty() {
                continue;
            }
            for &target in targets {
                self.add_descendants(target, &mut entry);
            }
            let domain = self.domain(transition);
            for target in self.effective_targets(transition) {
                self.add_ancestors(target, domain, &mut entry);
            }
        }
        entry
    }

    fn add_descendants(&self, node: NodeId, entry: &mut EntrySet) {
        let graph = self.graph;
        let state = graph.node(node);
        if state.kind == StateKind::History {
            match self.history.get(&node) {
                Some(recorded) => {
                    for &stored in recorded {
                        self.add_descendants(stored, entry);
                    }
                    for &stored in recorded {
                        self.add_ancestors(stored, state.parent, entry);
                    }
                }
                None => {
                    let Some(default) = self.history_default(node) else {
                        return;
                    };
                    if state.history_default.is_some() {
                        if let Some(parent) = state.parent {
                            entry.history_actions.insert(parent, default);
                        }
                    }
                    for &target in &graph.transition(default).targets {
                        self.add_descendants(target, entry);
                        self.add_ancestors(target, state.parent, entry);
                    }
                }
            }
            return;
        }

        entry.states.insert(node);
        match state.kind {
            StateKind::Compound => {
                entry.default_entry.insert(node);
                if let Some(initial) = state.initial {
                    for &target in &graph.transition(initial).targets {
                        self.add_descendants(target, entry);
                        self.add_ancestors(target, Some(node), entry);
                    }
                }
            }
            StateKind::Parallel => self.fill_regions(node, entry),
            _ => {}
        }
    }

    fn add_ancestors(&self, node: NodeId, stop: Option<NodeId>, entry: &mut EntrySet) {
        for ancestor in self.graph.proper_ancestors(node, stop) {
            entry.states.insert(ancestor);
            if self.graph.node(ancestor).kind == StateKind::Parallel {
                self.fill_regions(ancestor, entry);
            }
        }
    }

    fn fill_regions(&self, parallel: NodeId, entry: &mut EntrySet) {
        let graph = self.graph;
        for &region in &graph.node(parallel).children {
            if graph.node(region).kind == StateKind::History {
                continue;
            }
            let covered = entry
                .states
                .iter()
                .any(|&state| state == region || graph.is_descendant(state, region));
            if !covered {
                self.add_descendants(region, entry);
            }
        }
    }

    fn enter(&mut self, entry: EntrySet, event: &Event) -> MachineResult<()> {
        let graph = self.graph;
        let me = self.scope.self_ref().clone();
        let mut completed = BTreeSet::new();
        for &node in &entry.states {
            if self.config.contains(&node) {
                continue;
            }
            self.config.insert(node);
            let state = graph.node(node);
            for (delay, delayed) in &state.delays {
                self.scope
                    .send_after(&me, Event::new(delayed.clone()), *delay, delayed.clone());
            }
            self.run_actions(&state.entry, event)?;
            if entry.default_entry.contains(&node) {
                if let Some(initial) = state.initial {
                    self.run_actions(&graph.transition(initial).actions, event)?;
                }
            }
            if let Some(&transition) = entry.history_actions.get(&node) {
                self.run_actions(&graph.transition(transition).actions, event)?;
            }
            for invocation in &state.invokes {
                let input = invocation
                    .input
                    .as_ref()
                    .map_or(Value::Null, |input| input(&self.context, event));
                let child = self.scope.spawn_child(
                    &invocation.id,
                    &invocation.src,
                    invocation.logic.clone(),
                    input,
                    invocation.system_id.clone(),
                );
                self.children.insert(invocation.id.clone(), child);
            }
            if state.kind == StateKind::Final {
                self.complete(node, event, &mut completed);
            }
        }
        Ok(())
    }

    fn complete(&mut self, node: NodeId, event: &Event, completed: &mut BTreeSet<NodeId>) {
        let graph = self.graph;
        let state = graph.node(node);
        let output = state.output.as_ref().map(|output| output(&self.context, event));
        let Some(parent) = state.parent else {
            self.finish(node, output);
            return;
        };

        let parent_state = graph.node(parent);
        let mut marker = match parent_state.kind {
            StateKind::Parallel => Some(parent),
            _ => parent_state.parent,
        };
        let mut completion = marker.unwrap_or(node);
        if parent_state.kind == StateKind::Compound {
            self.internal
                .push_back(Event::done_state(&parent_state.id, output.clone()));
        }
        while let Some(ancestor) = marker {
            if graph.node(ancestor).kind != StateKind::Parallel
                || completed.contains(&ancestor)
                || !self.in_final_state(ancestor)
            {
                break;
            }
            completed.insert(ancestor);
            self.internal
                .push_back(Event::done_state(&graph.node(ancestor).id, None));
            completion = ancestor;
            marker = graph.node(ancestor).parent;
        }
        if marker.is_none() {
            self.finish(completion, output);
        }
    }

    fn finish(&mut self, completion: NodeId, output: Option<Value>) {
        let done = Event::done_state(&self.graph.node(completion).id, output.clone());
        self.status = SnapshotStatus::Done;
        self.output = Some(match self.machine_output {
            Some(map) => map(&self.context, &done),
            None => output.unwrap_or(Value::Null),
        });
    }

    fn in_final_state(&self, node: NodeId) -> bool {
        let graph = self.graph;
        let state = graph.node(node);
        match state.kind {
            StateKind::Compound => state.children.iter().any(|&child| {
                self.config.contains(&child) && graph.node(child).kind == StateKind::Final
            }),
            StateKind::Parallel => state
                .children
                .iter()
                .filter(|&&child| graph.node(child).kind != StateKind::History)
                .all(|&child| self.in_final_state(child)),
            StateKind::Final => true,
            StateKind::Atomic | StateKind::History => false,
        }
    }

    fn run_actions(&mut self, actions: &[Action], event: &Event) -> MachineResult<()> {
        for action in actions {
            self.run_action(action, event)?;
        }
        Ok(())
    }

    fn run_action(&mut self, action: &Action, event: &Event) -> MachineResult<()> {
        match action {
            Action::Named(name) => {
                return Err(MachineError::Configuration(format!("unresolved action '{name}'")));
            }
            Action::Assign(patch) => {
                let patch = patch(&self.context, event);
                self.context = merge_patch(&self.context, patch);
            }
            Action::Raise { event: source, delay, id } => {
                let raised = source.resolve(&self.context, event);
                match delay {
                    None => self.internal.push_back(raised),
                    Some(delay) => {
                        let me = self.scope.self_ref().clone();
                        let id = id.clone().unwrap_or_else(|| raised.event_type().to_string());
                        self.scope.send_after(&me, raised, fixed(delay)?, id);
                    }
                }
            }
            Action::SendTo {
                target,
                event: source,
                delay,
                id,
            } => {
                let outgoing = source.resolve(&self.context, event);
                let recipient = self
                    .children
                    .get(target)
                    .cloned()
                    .or_else(|| self.scope.system().get(target));
                let Some(recipient) = recipient else {
                    tracing::warn!(target = %target, event = outgoing.event_type(), "send target not found");
                    return Ok(());
                };
                match delay {
                    None => self.scope.send(&recipient, outgoing),
                    Some(delay) => {
                        let id = id.clone().unwrap_or_else(|| outgoing.event_type().to_string());
                        self.scope.send_after(&recipient, outgoing, fixed(delay)?, id);
                    }
                }
            }
            Action::SendParent(source) => {
                let outgoing = source.resolve(&self.context, event);
                match self.scope.self_ref().parent() {
                    Some(parent) => self.scope.send(&parent, outgoing),
                    None => tracing::warn!(event = outgoing.event_type(), "sendParent from a root actor"),
                }
            }
            Action::Cancel(id) => self.scope.cancel(id.clone()),
            Action::Log(message) => {
                let line = message(&self.context, event);
                let path = self.scope.self_ref().path().to_string();
                self.scope.defer(Effect::Run(Box::new(move || {
                    tracing::info!(actor = %path, "{line}");
                })));
            }
            Action::Spawn {
                id,
                src,
                input,
                system_id,
                assign_to,
            } => {
                let Source::Logic { src, logic } = src else {
                    return Err(MachineError::Configuration(format!("unresolved actor source for '{id}'")));
                };
                let input = input.as_ref().map_or(Value::Null, |input| input(&self.context, event));
                let child = self
                    .scope
                    .spawn_child(id, src, logic.clone(), input, system_id.clone());
                self.children.insert(id.clone(), child);
                if let Some(key) = assign_to {
                    match &mut self.context {
                        Value::Object(map) => {
                            map.insert(key.clone(), actor_reference(id));
                        }
                        _ => tracing::warn!(child = %id, "context is not an object; spawned reference not stored"),
                    }
                }
            }
            Action::StopChild(id) => {
                if let Some(child) = self.children.remove(id) {
                    self.scope.stop_child(&child);
                }
            }
            Action::Effect(run) => {
                let run = run.clone();
                let context = self.context.clone();
                let event = event.clone();
                self.scope
                    .defer(Effect::Run(Box::new(move || run(&context, &event))));
            }
        }
        Ok(())
    }

    /// Commit the working copy into a snapshot
    pub(crate) fn into_snapshot(self) -> Snapshot {
        let graph = self.graph;
        let history_value: BTreeMap<String, Vec<String>> = self
            .history
            .iter()
            .map(|(&node, recorded)| {
                let ids: Vec<String> = recorded.iter().map(|&id| graph.node(id).id.clone()).collect();
                (graph.node(node).id.clone(), ids)
            })
            .collect();
        Snapshot {
            status: self.status,
            value: graph.state_value(&self.config),
            context: self.context,
            children: self.children,
            history_value,
            tags: tags(graph, &self.config),
            error: None,
            output: self.output,
        }
    }
}

/// Tags of every node in `config`
pub(crate) fn tags(graph: &Graph, config: &BTreeSet<NodeId>) -> BTreeSet<String> {
    config
        .iter()
        .flat_map(|&node| graph.node(node).tags.iter().cloned())
        .collect()
}

fn find_node(graph: &Graph, id: &str) -> MachineResult<NodeId> {
    graph
        .find(id)
        .ok_or_else(|| MachineError::InvalidStateValue(format!("unknown state '{id}' in history")))
}

fn fixed(delay: &Delay) -> MachineResult<Duration> {
    match delay {
        Delay::Fixed(duration) => Ok(*duration),
        Delay::Named(name) => Err(MachineError::Configuration(format!("unresolved delay '{name}'"))),
    }
}
