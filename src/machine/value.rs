//! State values and active node sets
//!
//! A state value is the JSON shape of a configuration: a compound node
//! contributes its active child (a string when that child is a leaf, a nested
//! object otherwise) and a parallel node contributes an object of regions.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

use super::config::StateKind;
use super::node::{Graph, NodeId, ROOT};
use crate::runtime::error::{MachineError, MachineResult};

impl Graph {
    /// State value of an active node set
    pub fn state_value(&self, config: &BTreeSet<NodeId>) -> Value {
        self.value_of(ROOT, config)
    }

    fn value_of(&self, node: NodeId, config: &BTreeSet<NodeId>) -> Value {
        let state = self.node(node);
        match state.kind {
            StateKind::Compound => {
                let active = state.children.iter().copied().find(|child| config.contains(child));
                match active {
                    Some(child) if self.node(child).is_atomic() => {
                        Value::String(self.node(child).key.clone())
                    }
                    Some(child) => {
                        let mut map = Map::new();
                        map.insert(self.node(child).key.clone(), self.value_of(child, config));
                        Value::Object(map)
                    }
                    None => Value::Object(Map::new()),
                }
            }
            StateKind::Parallel => Value::Object(
                state
                    .children
                    .iter()
                    .copied()
                    .filter(|&child| self.node(child).kind != StateKind::History)
                    .map(|child| (self.node(child).key.clone(), self.value_of(child, config)))
                    .collect(),
            ),
            _ => Value::Object(Map::new()),
        }
    }

    /// Active node set described by a state value
    ///
    /// Missing parts of the value are filled with default initial states, so
    /// a null value resolves to the initial configuration.
    pub fn resolve_value(&self, value: &Value) -> MachineResult<BTreeSet<NodeId>> {
        let mut config = BTreeSet::new();
        self.resolve_into(ROOT, value, &mut config)?;
        Ok(config)
    }

    fn resolve_into(&self, node: NodeId, value: &Value, config: &mut BTreeSet<NodeId>) -> MachineResult<()> {
        config.insert(node);
        let state = self.node(node);
        match state.kind {
            StateKind::Compound => match value {
                Value::String(key) => {
                    let child = self.child_by_key(node, key)?;
                    self.resolve_into(child, &Value::Null, config)
                }
                Value::Object(map) if map.len() == 1 => {
                    let (key, sub) = map.iter().next().ok_or_else(|| self.invalid(node, value))?;
                    let child = self.child_by_key(node, key)?;
                    self.resolve_into(child, sub, config)
                }
                Value::Null => self.resolve_default(node, config),
                Value::Object(map) if map.is_empty() => self.resolve_default(node, config),
                _ => Err(self.invalid(node, value)),
            },
            StateKind::Parallel => {
                let regions = match value {
                    Value::Object(map) => Some(map),
                    Value::Null => None,
                    _ => return Err(self.invalid(node, value)),
                };
                if let Some(map) = regions {
                    for key in map.keys() {
                        self.child_by_key(node, key)?;
                    }
                }
                for &child in &state.children {
                    if self.node(child).kind == StateKind::History {
                        continue;
                    }
                    let sub = regions
                        .and_then(|map| map.get(&self.node(child).key))
                        .unwrap_or(&Value::Null);
                    self.resolve_into(child, sub, config)?;
                }
                Ok(())
            }
            StateKind::Atomic | StateKind::Final => match value {
                Value::Null => Ok(()),
                Value::Object(map) if map.is_empty() => Ok(()),
                _ => Err(self.invalid(node, value)),
            },
            StateKind::History => Err(MachineError::InvalidStateValue(format!(
                "history node '{}' cannot be active",
                state.id
            ))),
        }
    }

    fn resolve_default(&self, node: NodeId, config: &mut BTreeSet<NodeId>) -> MachineResult<()> {
        let Some(initial) = self.node(node).initial else {
            return Ok(());
        };
        for &target in &self.transition(initial).targets {
            for ancestor in self.proper_ancestors(target, Some(node)) {
                config.insert(ancestor);
            }
            self.resolve_into(target, &Value::Null, config)?;
        }
        Ok(())
    }

    fn child_by_key(&self, node: NodeId, key: &str) -> MachineResult<NodeId> {
        self.node(node)
            .children
            .iter()
            .copied()
            .find(|&child| self.node(child).key == key && self.node(child).kind != StateKind::History)
            .ok_or_else(|| {
                MachineError::InvalidStateValue(format!(
                    "'{}' has no child '{key}'",
                    self.node(node).id
                ))
            })
    }

    fn invalid(&self, node: NodeId, value: &Value) -> MachineError {
        MachineError::InvalidStateValue(format!("{value} does not fit state '{}'", self.node(node).id))
    }

    /// Make `target` active in place of whatever its compound ancestors held
    ///
    /// The target is entered with its default descendants; sibling regions of
    /// any enclosing parallel node keep their state.
    pub fn force_state(&self, value: &Value, target: &str) -> MachineResult<Value> {
        let node = self.find(target).ok_or_else(|| {
            MachineError::InvalidStateValue(format!("unknown state '{target}'"))
        })?;
        if self.node(node).kind == StateKind::History {
            return Err(MachineError::InvalidStateValue(format!(
                "cannot force history node '{target}'"
            )));
        }
        let mut config = self.resolve_value(value)?;
        config.retain(|&active| !self.is_descendant(active, node));
        config.insert(node);

        let mut on_path = node;
        for ancestor in self.proper_ancestors(node, None) {
            if self.node(ancestor).kind == StateKind::Compound {
                config.retain(|&active| {
                    !self.is_descendant(active, ancestor)
                        || active == on_path
                        || self.is_descendant(active, on_path)
                });
            }
            config.insert(ancestor);
            on_path = ancestor;
        }
        self.resolve_into(node, &Value::Null, &mut config)?;
        Ok(self.state_value(&config))
    }
}
