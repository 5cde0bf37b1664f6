//! Statechart configuration builders
//!
//! These types describe a machine before it is compiled. They keep names
//! unresolved; `StateMachine::new` turns them into the immutable node arena
//! and rejects anything that does not resolve.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use super::action::{Action, Delay, Guard, Source, ValueFn};
use crate::runtime::actor::ActorLogic;
use crate::runtime::event::Event;

/// Kind of a state node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// No children
    Atomic,
    /// Exactly one active child
    Compound,
    /// All children active
    Parallel,
    /// Completes its parent
    Final,
    /// Pseudo-state restoring a previous configuration
    History,
}

/// Depth of a history node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryKind {
    /// Direct children of the parent
    Shallow,
    /// Atomic descendants of the parent
    Deep,
}

/// A transition before target resolution
#[derive(Clone, Default)]
pub struct TransitionConfig {
    pub(crate) targets: Vec<String>,
    pub(crate) guard: Option<Guard>,
    pub(crate) actions: Vec<Action>,
    pub(crate) reenter: bool,
}

impl TransitionConfig {
    /// Transition to one target
    pub fn to(target: impl Into<String>) -> Self {
        Self {
            targets: vec![target.into()],
            ..Self::default()
        }
    }

    /// Transition to several targets, typically in parallel regions
    pub fn targets<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            targets: targets.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Targetless transition that only runs actions
    pub fn internal() -> Self {
        Self::default()
    }

    /// Guard the transition
    pub fn guard(mut self, guard: Guard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Append an action
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Exit and re-enter the source even when targets are its descendants
    pub fn reenter(mut self) -> Self {
        self.reenter = true;
        self
    }
}

/// An actor started on entry to a state and stopped on exit
#[derive(Clone)]
pub struct InvokeConfig {
    pub(crate) id: Option<String>,
    pub(crate) src: Source,
    pub(crate) input: Option<ValueFn>,
    pub(crate) system_id: Option<String>,
    pub(crate) on_done: Vec<TransitionConfig>,
    pub(crate) on_error: Vec<TransitionConfig>,
}

impl InvokeConfig {
    /// Invoke an actor source registered in `Implementations`
    pub fn named(src: impl Into<String>) -> Self {
        Self::from_source(Source::Named(src.into()))
    }

    /// Invoke inline logic; `src` is the key used to recreate it on restore
    pub fn logic(src: impl Into<String>, logic: Arc<dyn ActorLogic>) -> Self {
        Self::from_source(Source::Logic {
            src: src.into(),
            logic,
        })
    }

    fn from_source(src: Source) -> Self {
        Self {
            id: None,
            src,
            input: None,
            system_id: None,
            on_done: Vec::new(),
            on_error: Vec::new(),
        }
    }

    /// Child id; defaults to `<state id>:invocation[<index>]`
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Map context and the entering event to the child's input
    pub fn input(mut self, input: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Self {
        self.input = Some(Arc::new(input));
        self
    }

    /// Register the child under a system id
    pub fn system_id(mut self, system_id: impl Into<String>) -> Self {
        self.system_id = Some(system_id.into());
        self
    }

    /// Transition taken when the child reaches `done`
    pub fn on_done(mut self, transition: TransitionConfig) -> Self {
        self.on_done.push(transition);
        self
    }

    /// Transition taken when the child fails
    pub fn on_error(mut self, transition: TransitionConfig) -> Self {
        self.on_error.push(transition);
        self
    }
}

/// A state node before compilation
#[derive(Clone, Default)]
pub struct StateConfig {
    pub(crate) kind: Option<StateKind>,
    pub(crate) history: Option<HistoryKind>,
    pub(crate) id: Option<String>,
    pub(crate) initial: Option<String>,
    pub(crate) initial_actions: Vec<Action>,
    pub(crate) states: Vec<(String, StateConfig)>,
    pub(crate) entry: Vec<Action>,
    pub(crate) exit: Vec<Action>,
    pub(crate) on: Vec<(String, TransitionConfig)>,
    pub(crate) always: Vec<TransitionConfig>,
    pub(crate) after: Vec<(Delay, TransitionConfig)>,
    pub(crate) invoke: Vec<InvokeConfig>,
    pub(crate) on_done: Vec<TransitionConfig>,
    pub(crate) tags: Vec<String>,
    pub(crate) output: Option<ValueFn>,
    pub(crate) history_default: Option<TransitionConfig>,
}

impl StateConfig {
    /// A leaf state
    pub fn atomic() -> Self {
        Self {
            kind: Some(StateKind::Atomic),
            ..Self::default()
        }
    }

    /// A state with one active child, entering `initial` by default
    pub fn compound(initial: impl Into<String>) -> Self {
        Self {
            kind: Some(StateKind::Compound),
            initial: Some(initial.into()),
            ..Self::default()
        }
    }

    /// A state whose children are all active
    pub fn parallel() -> Self {
        Self {
            kind: Some(StateKind::Parallel),
            ..Self::default()
        }
    }

    /// A final state
    pub fn final_state() -> Self {
        Self {
            kind: Some(StateKind::Final),
            ..Self::default()
        }
    }

    /// A history pseudo-state
    pub fn history(kind: HistoryKind) -> Self {
        Self {
            kind: Some(StateKind::History),
            history: Some(kind),
            ..Self::default()
        }
    }

    /// A history pseudo-state with a target used when no history exists yet
    pub fn history_with_default(kind: HistoryKind, default: TransitionConfig) -> Self {
        Self {
            history_default: Some(default),
            ..Self::history(kind)
        }
    }

    /// Add a child state; document order is declaration order
    pub fn state(mut self, key: impl Into<String>, state: StateConfig) -> Self {
        self.states.push((key.into(), state));
        self
    }

    /// Add a transition for an event descriptor (`"SUBMIT"`, `"error.*"`, `"*"`)
    pub fn on(mut self, descriptor: impl Into<String>, transition: TransitionConfig) -> Self {
        self.on.push((descriptor.into(), transition));
        self
    }

    /// Add an eventless transition
    pub fn always(mut self, transition: TransitionConfig) -> Self {
        self.always.push(transition);
        self
    }

    /// Add a delayed transition
    pub fn after(mut self, delay: impl Into<Delay>, transition: TransitionConfig) -> Self {
        self.after.push((delay.into(), transition));
        self
    }

    /// Add an entry action
    pub fn entry(mut self, action: Action) -> Self {
        self.entry.push(action);
        self
    }

    /// Add an exit action
    pub fn exit(mut self, action: Action) -> Self {
        self.exit.push(action);
        self
    }

    /// Invoke an actor while the state is active
    pub fn invoke(mut self, invoke: InvokeConfig) -> Self {
        self.invoke.push(invoke);
        self
    }

    /// Transition taken when the state completes
    pub fn on_done(mut self, transition: TransitionConfig) -> Self {
        self.on_done.push(transition);
        self
    }

    /// Tag the state
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Output of a final state, carried by the parent's done event
    pub fn output(mut self, output: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }

    /// Custom id, addressable as `#id`
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Actions run when the state is entered through its default initial child
    pub fn initial_actions(mut self, action: Action) -> Self {
        self.initial_actions.push(action);
        self
    }
}

/// Initial context of a machine
#[derive(Clone)]
pub(crate) enum ContextInit {
    Value(Value),
    FromInput(Arc<dyn Fn(&Value) -> Value + Send + Sync>),
}

/// A whole machine before compilation
#[derive(Clone)]
pub struct MachineConfig {
    pub(crate) id: String,
    pub(crate) root: StateConfig,
    pub(crate) context: ContextInit,
    pub(crate) output: Option<ValueFn>,
}

impl MachineConfig {
    /// Machine `id` with the given root state
    pub fn new(id: impl Into<String>, root: StateConfig) -> Self {
        Self {
            id: id.into(),
            root,
            context: ContextInit::Value(Value::Object(Default::default())),
            output: None,
        }
    }

    /// Fixed initial context
    pub fn context(mut self, context: Value) -> Self {
        self.context = ContextInit::Value(context);
        self
    }

    /// Initial context computed from the actor input
    pub fn context_from_input(mut self, build: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.context = ContextInit::FromInput(Arc::new(build));
        self
    }

    /// Output computed when the machine reaches its top-level final state
    pub fn output(mut self, output: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }
}

/// Named implementations referenced from a configuration
#[derive(Clone, Default)]
pub struct Implementations {
    pub(crate) actions: HashMap<String, Action>,
    pub(crate) guards: HashMap<String, Guard>,
    pub(crate) actors: HashMap<String, Arc<dyn ActorLogic>>,
    pub(crate) delays: HashMap<String, Duration>,
}

impl Implementations {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named action
    pub fn action(mut self, name: impl Into<String>, action: Action) -> Self {
        self.actions.insert(name.into(), action);
        self
    }

    /// Register a named guard
    pub fn guard(mut self, name: impl Into<String>, guard: Guard) -> Self {
        self.guards.insert(name.into(), guard);
        self
    }

    /// Register an actor source
    pub fn actor(mut self, name: impl Into<String>, logic: Arc<dyn ActorLogic>) -> Self {
        self.actors.insert(name.into(), logic);
        self
    }

    /// Register a named delay
    pub fn delay(mut self, name: impl Into<String>, delay: Duration) -> Self {
        self.delays.insert(name.into(), delay);
        self
    }
}
