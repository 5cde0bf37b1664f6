//! Actor snapshots and their persisted form
//!
//! A `Snapshot` is replaced wholesale on every processed event. Its
//! persisted mirror swaps live child references for the children's own
//! persisted snapshots so a whole actor tree can be written as JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::actor::ActorRef;
use super::scheduler::ScheduledEvent;

/// Marker kind for actor references stored in context
pub const ACTOR_REFERENCE: &str = "actor-reference";

/// Observable lifecycle status of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotStatus {
    /// Processing events
    Active,
    /// Reached a final configuration
    Done,
    /// Failed
    Error,
    /// Stopped from outside
    Stopped,
}

impl SnapshotStatus {
    /// Whether no further events will be processed
    pub fn is_terminal(self) -> bool {
        !matches!(self, SnapshotStatus::Active)
    }
}

/// Immutable view of an actor's state
#[derive(Clone)]
pub struct Snapshot {
    /// Lifecycle status
    pub status: SnapshotStatus,
    /// Active state value (string leaf or nested object)
    pub value: Value,
    /// Data owned by the actor
    pub context: Value,
    /// Child actors owned by this actor, keyed by child id
    pub children: BTreeMap<String, ActorRef>,
    /// History node id to previously active node ids
    pub history_value: BTreeMap<String, Vec<String>>,
    /// Tags of the active state nodes
    pub tags: BTreeSet<String>,
    /// Error message when status is `Error`
    pub error: Option<String>,
    /// Output when status is `Done`
    pub output: Option<Value>,
}

impl Snapshot {
    /// An active snapshot with the given context and no state value
    pub fn new(context: Value) -> Self {
        Self {
            status: SnapshotStatus::Active,
            value: Value::Null,
            context,
            children: BTreeMap::new(),
            history_value: BTreeMap::new(),
            tags: BTreeSet::new(),
            error: None,
            output: None,
        }
    }

    /// Whether the state value contains the dotted path, e.g. `"form.editing"`
    pub fn matches(&self, path: &str) -> bool {
        let segments: Vec<&str> = path.split('.').collect();
        value_matches(&self.value, &segments)
    }

    /// Whether an active state node carries `tag`
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Resolve an actor-reference marker found at a JSON pointer in context
    pub fn actor_at(&self, pointer: &str) -> Option<&ActorRef> {
        let id = actor_reference_id(self.context.pointer(pointer)?)?;
        self.children.get(id)
    }

    /// Build the persisted form around already-persisted children
    pub fn to_persisted(&self, children: BTreeMap<String, PersistedChild>) -> PersistedSnapshot {
        PersistedSnapshot {
            status: self.status,
            value: self.value.clone(),
            context: self.context.clone(),
            children,
            history_value: self.history_value.clone(),
            tags: self.tags.clone(),
            error: self.error.clone(),
            output: self.output.clone(),
            scheduled: Vec::new(),
        }
    }
}

/// Revives everything except children, which need their logic to come back
impl From<&PersistedSnapshot> for Snapshot {
    fn from(persisted: &PersistedSnapshot) -> Self {
        Self {
            status: persisted.status,
            value: persisted.value.clone(),
            context: persisted.context.clone(),
            children: BTreeMap::new(),
            history_value: persisted.history_value.clone(),
            tags: persisted.tags.clone(),
            error: persisted.error.clone(),
            output: persisted.output.clone(),
        }
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("status", &self.status)
            .field("value", &self.value)
            .field("context", &self.context)
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("history_value", &self.history_value)
            .field("tags", &self.tags)
            .field("error", &self.error)
            .field("output", &self.output)
            .finish()
    }
}

fn value_matches(value: &Value, segments: &[&str]) -> bool {
    match segments.split_first() {
        None => true,
        Some((head, rest)) => match value {
            Value::String(leaf) => rest.is_empty() && leaf == head,
            Value::Object(map) => map
                .get(*head)
                .is_some_and(|child| value_matches(child, rest)),
            _ => false,
        },
    }
}

/// Serializable snapshot of an actor and its descendants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    /// Lifecycle status
    pub status: SnapshotStatus,
    /// Active state value
    pub value: Value,
    /// Context with actor references as markers
    pub context: Value,
    /// Persisted children keyed by child id
    #[serde(default)]
    pub children: BTreeMap<String, PersistedChild>,
    /// History values
    #[serde(default)]
    pub history_value: BTreeMap<String, Vec<String>>,
    /// Active tags
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Error message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Pending timers of the whole tree, present on root snapshots only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scheduled: Vec<ScheduledEvent>,
}

/// A persisted child together with the source that recreates its logic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedChild {
    /// Logic source key
    pub src: String,
    /// Child snapshot
    pub snapshot: PersistedSnapshot,
}

/// The context marker standing in for a child actor reference
pub fn actor_reference(id: &str) -> Value {
    json!({ "kind": ACTOR_REFERENCE, "id": id })
}

/// Child id named by an actor-reference marker
pub fn actor_reference_id(value: &Value) -> Option<&str> {
    let object = value.as_object()?;
    if object.get("kind")?.as_str()? != ACTOR_REFERENCE {
        return None;
    }
    object.get("id")?.as_str()
}

/// Every child id referenced anywhere inside a context value
pub fn actor_references(context: &Value) -> Vec<String> {
    let mut found = Vec::new();
    collect_references(context, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<String>) {
    if let Some(id) = actor_reference_id(value) {
        found.push(id.to_string());
        return;
    }
    match value {
        Value::Object(map) => map.values().for_each(|child| collect_references(child, found)),
        Value::Array(items) => items.iter().for_each(|child| collect_references(child, found)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_nested_values() {
        let mut snapshot = Snapshot::new(Value::Null);
        snapshot.value = json!({"upload": {"retrying": "waiting"}, "audit": {}});
        assert!(snapshot.matches("upload"));
        assert!(snapshot.matches("upload.retrying.waiting"));
        assert!(snapshot.matches("audit"));
        assert!(!snapshot.matches("upload.idle"));
        assert!(!snapshot.matches("audit.on"));
    }

    #[test]
    fn test_reference_markers_are_collected() {
        let context = json!({
            "worker": actor_reference("worker-1"),
            "pool": [actor_reference("a"), {"nested": actor_reference("b")}],
            "plain": {"kind": "other", "id": "c"}
        });
        assert_eq!(actor_reference_id(&context["worker"]), Some("worker-1"));
        assert_eq!(actor_references(&context), vec!["a", "b", "worker-1"]);
    }

    #[test]
    fn test_persisted_snapshot_uses_camel_case() {
        let snapshot = Snapshot::new(json!({"n": 1}));
        let persisted = snapshot.to_persisted(BTreeMap::new());
        let value = serde_json::to_value(&persisted).unwrap();
        assert_eq!(value["status"], json!("active"));
        assert!(value.get("historyValue").is_some());
        assert!(value.get("scheduled").is_none());
    }
}
