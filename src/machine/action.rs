//! Actions and guards
//!
//! Both are tagged unions. `Named` variants refer to entries of an
//! `Implementations` table and are replaced by their implementation when the
//! machine is compiled, so an unknown name is a configuration error rather
//! than a runtime surprise.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::runtime::actor::ActorLogic;
use crate::runtime::event::Event;

/// Computes a context patch from the current context and event
pub type AssignFn = Arc<dyn Fn(&Value, &Event) -> Value + Send + Sync>;
/// Computes an event from the current context and event
pub type EventFn = Arc<dyn Fn(&Value, &Event) -> Event + Send + Sync>;
/// Decides whether a transition is enabled
pub type GuardFn = Arc<dyn Fn(&Value, &Event) -> anyhow::Result<bool> + Send + Sync>;
/// Side effect run after the step commits
pub type EffectFn = Arc<dyn Fn(&Value, &Event) + Send + Sync>;
/// Maps context and event to a value (invoke input, state output)
pub type ValueFn = Arc<dyn Fn(&Value, &Event) -> Value + Send + Sync>;
/// Builds a log line
pub type LogFn = Arc<dyn Fn(&Value, &Event) -> String + Send + Sync>;

/// Event produced by an action
#[derive(Clone)]
pub enum EventSource {
    /// A fixed event
    Fixed(Event),
    /// An event computed when the action runs
    Dynamic(EventFn),
}

impl EventSource {
    pub(crate) fn resolve(&self, context: &Value, event: &Event) -> Event {
        match self {
            EventSource::Fixed(fixed) => fixed.clone(),
            EventSource::Dynamic(build) => build(context, event),
        }
    }
}

impl From<Event> for EventSource {
    fn from(event: Event) -> Self {
        EventSource::Fixed(event)
    }
}

/// Delay of a delayed transition or send
#[derive(Debug, Clone, PartialEq)]
pub enum Delay {
    /// A literal duration
    Fixed(Duration),
    /// A delay looked up in `Implementations`
    Named(String),
}

impl From<Duration> for Delay {
    fn from(duration: Duration) -> Self {
        Delay::Fixed(duration)
    }
}

/// Where the logic of a spawned or invoked actor comes from
#[derive(Clone)]
pub enum Source {
    /// Looked up in `Implementations`; the name is also the restore key
    Named(String),
    /// Inline logic with the key used to find it again on restore
    Logic {
        /// Restore key
        src: String,
        /// Logic
        logic: Arc<dyn ActorLogic>,
    },
}

/// An executable action
#[derive(Clone)]
pub enum Action {
    /// Reference to a named implementation
    Named(String),
    /// Merge a patch into the context (objects merge shallowly, anything else replaces)
    Assign(AssignFn),
    /// Put an event on the internal queue, or deliver it to self after a delay
    Raise {
        /// Event
        event: EventSource,
        /// Optional delay
        delay: Option<Delay>,
        /// Cancellation id for delayed raises
        id: Option<String>,
    },
    /// Send to a child id or system id
    SendTo {
        /// Child id or system id
        target: String,
        /// Event
        event: EventSource,
        /// Optional delay
        delay: Option<Delay>,
        /// Cancellation id for delayed sends
        id: Option<String>,
    },
    /// Send to the parent actor
    SendParent(EventSource),
    /// Cancel a delayed raise or send by id
    Cancel(String),
    /// Write a log line through tracing
    Log(LogFn),
    /// Spawn a child actor
    Spawn {
        /// Child id
        id: String,
        /// Child logic
        src: Source,
        /// Child input
        input: Option<ValueFn>,
        /// Optional globally addressable id
        system_id: Option<String>,
        /// Context key that receives an actor-reference marker
        assign_to: Option<String>,
    },
    /// Stop a child by id
    StopChild(String),
    /// Arbitrary side effect, run after the step commits
    Effect(EffectFn),
}

impl Action {
    /// Reference a named action
    pub fn named(name: impl Into<String>) -> Self {
        Action::Named(name.into())
    }

    /// Merge the returned patch into the context
    pub fn assign(patch: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Self {
        Action::Assign(Arc::new(patch))
    }

    /// Raise an event onto the internal queue
    pub fn raise(event: Event) -> Self {
        Action::Raise {
            event: event.into(),
            delay: None,
            id: None,
        }
    }

    /// Deliver an event to self after a delay
    pub fn raise_after(event: Event, delay: impl Into<Delay>, id: impl Into<String>) -> Self {
        Action::Raise {
            event: event.into(),
            delay: Some(delay.into()),
            id: Some(id.into()),
        }
    }

    /// Send an event to a child or system id
    pub fn send_to(target: impl Into<String>, event: Event) -> Self {
        Action::SendTo {
            target: target.into(),
            event: event.into(),
            delay: None,
            id: None,
        }
    }

    /// Send a computed event to the parent
    pub fn send_parent(build: impl Fn(&Value, &Event) -> Event + Send + Sync + 'static) -> Self {
        Action::SendParent(EventSource::Dynamic(Arc::new(build)))
    }

    /// Cancel a delayed send
    pub fn cancel(id: impl Into<String>) -> Self {
        Action::Cancel(id.into())
    }

    /// Log a computed message at info level
    pub fn log(message: impl Fn(&Value, &Event) -> String + Send + Sync + 'static) -> Self {
        Action::Log(Arc::new(message))
    }

    /// Spawn a child whose reference is stored under `assign_to`
    pub fn spawn(id: impl Into<String>, src: Source, assign_to: Option<&str>) -> Self {
        Action::Spawn {
            id: id.into(),
            src,
            input: None,
            system_id: None,
            assign_to: assign_to.map(str::to_string),
        }
    }

    /// Stop a child by id
    pub fn stop_child(id: impl Into<String>) -> Self {
        Action::StopChild(id.into())
    }

    /// Run a side effect after the step commits
    pub fn effect(run: impl Fn(&Value, &Event) + Send + Sync + 'static) -> Self {
        Action::Effect(Arc::new(run))
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Action::Named(name) => return write!(f, "Action::Named({name})"),
            Action::Assign(_) => "assign",
            Action::Raise { .. } => "raise",
            Action::SendTo { target, .. } => return write!(f, "Action::SendTo({target})"),
            Action::SendParent(_) => "sendParent",
            Action::Cancel(id) => return write!(f, "Action::Cancel({id})"),
            Action::Log(_) => "log",
            Action::Spawn { id, .. } => return write!(f, "Action::Spawn({id})"),
            Action::StopChild(id) => return write!(f, "Action::StopChild({id})"),
            Action::Effect(_) => "effect",
        };
        write!(f, "Action::{kind}")
    }
}

/// A transition guard
#[derive(Clone)]
pub enum Guard {
    /// Reference to a named guard
    Named(String),
    /// Inline predicate with a name used in error messages
    Check {
        /// Name
        name: String,
        /// Predicate
        check: GuardFn,
    },
    /// Negation
    Not(Box<Guard>),
    /// All must pass; must not be empty
    And(Vec<Guard>),
    /// Any must pass; must not be empty
    Or(Vec<Guard>),
    /// The state with this id is active
    StateIn(String),
}

impl Guard {
    /// Inline guard
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&Value, &Event) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Guard::Check {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Reference a named guard
    pub fn named(name: impl Into<String>) -> Self {
        Guard::Named(name.into())
    }

    /// Negate a guard
    pub fn not(guard: Guard) -> Self {
        Guard::Not(Box::new(guard))
    }

    /// True when the state with `id` is active
    pub fn state_in(id: impl Into<String>) -> Self {
        Guard::StateIn(id.into())
    }

    /// Name used in error messages
    pub fn name(&self) -> String {
        match self {
            Guard::Named(name) | Guard::Check { name, .. } => name.clone(),
            Guard::Not(inner) => format!("not({})", inner.name()),
            Guard::And(items) => format!("and({})", join_names(items)),
            Guard::Or(items) => format!("or({})", join_names(items)),
            Guard::StateIn(id) => format!("stateIn({id})"),
        }
    }
}

fn join_names(guards: &[Guard]) -> String {
    guards.iter().map(Guard::name).collect::<Vec<_>>().join(", ")
}

impl fmt::Debug for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard({})", self.name())
    }
}

/// Shallow-merge `patch` into `context`
pub(crate) fn merge_patch(context: &Value, patch: Value) -> Value {
    match (context, patch) {
        (Value::Object(current), Value::Object(patch)) => {
            let mut merged = current.clone();
            merged.extend(patch);
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_patch_is_shallow() {
        let context = json!({"a": 1, "nested": {"x": 1}});
        let merged = merge_patch(&context, json!({"nested": {"y": 2}, "b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2, "nested": {"y": 2}}));
        assert_eq!(merge_patch(&json!(1), json!(2)), json!(2));
    }

    #[test]
    fn test_guard_names_compose() {
        let guard = Guard::And(vec![Guard::named("ready"), Guard::not(Guard::state_in("#m.busy"))]);
        assert_eq!(guard.name(), "and(ready, not(stateIn(#m.busy)))");
    }
}
