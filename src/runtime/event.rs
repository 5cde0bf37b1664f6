//! Events and session identifiers
//!
//! An event is a tagged record `{type, ...fields}`. A handful of types are
//! reserved for lifecycle signalling between actors and statecharts.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Delivered once when an actor computes its initial snapshot
pub const INIT: &str = "stepchart.init";
/// Internal stop signal cascaded to children
pub const STOP: &str = "stepchart.stop";
/// Prefix for completion of a compound or parallel state
pub const DONE_STATE: &str = "done.state.";
/// Prefix for completion of a child actor
pub const DONE_ACTOR: &str = "done.actor.";
/// Prefix for failure of a child actor
pub const ERROR_ACTOR: &str = "error.actor.";
/// Prefix for delayed transitions
pub const AFTER: &str = "after.";

/// Process-unique actor session identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x:{}", self.0)
    }
}

/// A tagged event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(flatten)]
    fields: Map<String, Value>,
}

impl Event {
    /// Create an event with no payload fields
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: Map::new(),
        }
    }

    /// Attach a field, replacing any previous value
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Build an event from a JSON object with a `type` key
    pub fn from_value(value: Value) -> Option<Self> {
        serde_json::from_value(value).ok()
    }

    /// The event type
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Read a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// All payload fields
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// `output` field of a done event
    pub fn output(&self) -> Option<&Value> {
        self.get("output")
    }

    /// `error` field of an error event, as text
    pub fn error_message(&self) -> Option<String> {
        self.get("error").map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// The init event, carrying the actor input
    pub fn init(input: Value) -> Self {
        Self::new(INIT).with("input", input)
    }

    /// The internal stop event
    pub fn stop() -> Self {
        Self::new(STOP)
    }

    /// Completion of state `id`
    pub fn done_state(id: &str, output: Option<Value>) -> Self {
        let event = Self::new(format!("{DONE_STATE}{id}"));
        match output {
            Some(output) => event.with("output", output),
            None => event,
        }
    }

    /// Completion of child actor `id`
    pub fn done_actor(id: &str, output: Option<Value>) -> Self {
        Self::new(format!("{DONE_ACTOR}{id}")).with("output", output.unwrap_or(Value::Null))
    }

    /// Failure of child actor `id`
    pub fn error_actor(id: &str, error: impl Into<String>) -> Self {
        Self::new(format!("{ERROR_ACTOR}{id}")).with("error", Value::String(error.into()))
    }

    /// Expiry of a delayed transition owned by state `id`
    pub fn after(delay_ms: u64, id: &str) -> Self {
        Self::new(after_type(delay_ms, id))
    }

    /// Whether this is the internal stop event
    pub fn is_stop(&self) -> bool {
        self.event_type == STOP
    }

    /// Whether this reports a child actor failure
    pub fn is_error(&self) -> bool {
        self.event_type.starts_with(ERROR_ACTOR)
    }
}

/// Event type used by a delayed transition
pub fn after_type(delay_ms: u64, id: &str) -> String {
    format!("{AFTER}{delay_ms}.{id}")
}
