//! Step conditions and the query predicate language
//!
//! Conditions either reference a prior step's output and test it with a
//! query predicate, or run a closure over the recorded results. Predicates
//! are plain serde trees in the familiar `$eq`/`$and` operator shape so they
//! can be stored alongside workflow definitions.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::{StepResult, TRIGGER};

/// A query over a JSON value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Equal to
    #[serde(rename = "$eq")]
    Eq(Value),
    /// Not equal to
    #[serde(rename = "$ne")]
    Ne(Value),
    /// Greater than
    #[serde(rename = "$gt")]
    Gt(Value),
    /// Greater than or equal to
    #[serde(rename = "$gte")]
    Gte(Value),
    /// Less than
    #[serde(rename = "$lt")]
    Lt(Value),
    /// Less than or equal to
    #[serde(rename = "$lte")]
    Lte(Value),
    /// Equal to one of
    #[serde(rename = "$in")]
    In(Vec<Value>),
    /// Equal to none of
    #[serde(rename = "$nin")]
    Nin(Vec<Value>),
    /// All hold
    #[serde(rename = "$and")]
    And(Vec<Predicate>),
    /// Any holds
    #[serde(rename = "$or")]
    Or(Vec<Predicate>),
    /// Does not hold
    #[serde(rename = "$not")]
    Not(Box<Predicate>),
    /// Some array element matches
    #[serde(rename = "$elemMatch")]
    ElemMatch(Box<Predicate>),
    /// Value is present (non-null) or absent
    #[serde(rename = "$exists")]
    Exists(bool),
    /// String matches a regular expression
    #[serde(rename = "$regex")]
    Regex(String),
    /// Array has exactly this many elements
    #[serde(rename = "$size")]
    Size(usize),
    /// Apply a predicate to a nested field
    #[serde(rename = "$at")]
    At {
        /// Dotted path
        path: String,
        /// Predicate for the field
        query: Box<Predicate>,
    },
}

impl Predicate {
    /// `$eq`
    pub fn eq(value: impl Into<Value>) -> Self {
        Predicate::Eq(value.into())
    }

    /// `$ne`
    pub fn ne(value: impl Into<Value>) -> Self {
        Predicate::Ne(value.into())
    }

    /// `$gt`
    pub fn gt(value: impl Into<Value>) -> Self {
        Predicate::Gt(value.into())
    }

    /// `$gte`
    pub fn gte(value: impl Into<Value>) -> Self {
        Predicate::Gte(value.into())
    }

    /// `$lt`
    pub fn lt(value: impl Into<Value>) -> Self {
        Predicate::Lt(value.into())
    }

    /// `$lte`
    pub fn lte(value: impl Into<Value>) -> Self {
        Predicate::Lte(value.into())
    }

    /// `$not`
    pub fn not(predicate: Predicate) -> Self {
        Predicate::Not(Box::new(predicate))
    }

    /// `$at`
    pub fn at(path: impl Into<String>, query: Predicate) -> Self {
        Predicate::At {
            path: path.into(),
            query: Box::new(query),
        }
    }

    /// `$and` or `$or` with no operands
    pub(crate) fn find_empty_group(&self) -> Option<&'static str> {
        match self {
            Predicate::And(items) if items.is_empty() => Some("$and"),
            Predicate::Or(items) if items.is_empty() => Some("$or"),
            Predicate::And(items) | Predicate::Or(items) => items.iter().find_map(Predicate::find_empty_group),
            Predicate::Not(inner) | Predicate::ElemMatch(inner) => inner.find_empty_group(),
            Predicate::At { query, .. } => query.find_empty_group(),
            _ => None,
        }
    }
}

/// Pluggable predicate engine
pub trait ConditionEvaluator: Send + Sync {
    /// Test `value` against `predicate`
    fn evaluate(&self, predicate: &Predicate, value: &Value) -> anyhow::Result<bool>;
}

/// Default evaluator for the `$`-operator language
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryEvaluator;

impl ConditionEvaluator for QueryEvaluator {
    fn evaluate(&self, predicate: &Predicate, value: &Value) -> anyhow::Result<bool> {
        Ok(match predicate {
            Predicate::Eq(expected) => value == expected,
            Predicate::Ne(expected) => value != expected,
            Predicate::Gt(bound) => compare(value, bound) == Some(Ordering::Greater),
            Predicate::Gte(bound) => matches!(compare(value, bound), Some(Ordering::Greater | Ordering::Equal)),
            Predicate::Lt(bound) => compare(value, bound) == Some(Ordering::Less),
            Predicate::Lte(bound) => matches!(compare(value, bound), Some(Ordering::Less | Ordering::Equal)),
            Predicate::In(options) => options.contains(value),
            Predicate::Nin(options) => !options.contains(value),
            Predicate::And(items) => {
                for item in items {
                    if !self.evaluate(item, value)? {
                        return Ok(false);
                    }
                }
                true
            }
            Predicate::Or(items) => {
                for item in items {
                    if self.evaluate(item, value)? {
                        return Ok(true);
                    }
                }
                false
            }
            Predicate::Not(inner) => !self.evaluate(inner, value)?,
            Predicate::ElemMatch(inner) => match value {
                Value::Array(items) => {
                    for item in items {
                        if self.evaluate(inner, item)? {
                            return Ok(true);
                        }
                    }
                    false
                }
                _ => false,
            },
            Predicate::Exists(expected) => !value.is_null() == *expected,
            Predicate::Regex(pattern) => {
                let regex = Regex::new(pattern).with_context(|| format!("invalid $regex '{pattern}'"))?;
                value.as_str().is_some_and(|text| regex.is_match(text))
            }
            Predicate::Size(size) => value.as_array().is_some_and(|items| items.len() == *size),
            Predicate::At { path, query } => {
                let field = value_at(value, path).unwrap_or(&Value::Null);
                self.evaluate(query, field)?
            }
        })
    }
}

fn compare(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Value at a dotted path; object keys or array indices, empty path is the value itself
pub fn value_at<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    })
}

type CheckFn = dyn Fn(&BTreeMap<String, StepResult>, &Value) -> anyhow::Result<bool> + Send + Sync;

/// Condition gating a step
#[derive(Clone)]
pub enum StepCondition {
    /// Query a prior step's output, or the trigger data when `step` is `trigger`
    Ref {
        /// Step id
        step: String,
        /// Dotted path into the output
        path: String,
        /// Predicate for the value found
        query: Predicate,
    },
    /// Closure over recorded results and trigger data
    Check(Arc<CheckFn>),
    /// All hold
    And(Vec<StepCondition>),
    /// Any holds
    Or(Vec<StepCondition>),
    /// Does not hold
    Not(Box<StepCondition>),
}

impl StepCondition {
    /// Query a prior step's output
    pub fn step(step: impl Into<String>, path: impl Into<String>, query: Predicate) -> Self {
        StepCondition::Ref {
            step: step.into(),
            path: path.into(),
            query,
        }
    }

    /// Query the trigger data
    pub fn trigger(path: impl Into<String>, query: Predicate) -> Self {
        Self::step(TRIGGER, path, query)
    }

    /// Closure condition
    pub fn check(
        check: impl Fn(&BTreeMap<String, StepResult>, &Value) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        StepCondition::Check(Arc::new(check))
    }

    /// Negation
    pub fn not(condition: StepCondition) -> Self {
        StepCondition::Not(Box::new(condition))
    }

    /// Evaluate against recorded results
    ///
    /// A reference to a step that has not succeeded is false.
    pub fn evaluate(
        &self,
        evaluator: &dyn ConditionEvaluator,
        steps: &BTreeMap<String, StepResult>,
        trigger_data: &Value,
    ) -> anyhow::Result<bool> {
        match self {
            StepCondition::Ref { step, path, query } => {
                let source = if step == TRIGGER {
                    trigger_data
                } else {
                    match steps.get(step) {
                        Some(StepResult::Success { output }) => output,
                        _ => return Ok(false),
                    }
                };
                let value = value_at(source, path).unwrap_or(&Value::Null);
                evaluator.evaluate(query, value)
            }
            StepCondition::Check(check) => check(steps, trigger_data),
            StepCondition::And(items) => {
                for item in items {
                    if !item.evaluate(evaluator, steps, trigger_data)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            StepCondition::Or(items) => {
                for item in items {
                    if item.evaluate(evaluator, steps, trigger_data)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            StepCondition::Not(inner) => Ok(!inner.evaluate(evaluator, steps, trigger_data)?),
        }
    }

    /// Steps referenced by `Ref` conditions, trigger excluded
    pub(crate) fn referenced_steps(&self) -> Vec<&str> {
        match self {
            StepCondition::Ref { step, .. } if step != TRIGGER => vec![step.as_str()],
            StepCondition::And(items) | StepCondition::Or(items) => {
                items.iter().flat_map(StepCondition::referenced_steps).collect()
            }
            StepCondition::Not(inner) => inner.referenced_steps(),
            _ => Vec::new(),
        }
    }

    /// Reject empty groups anywhere in the tree
    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        match self {
            StepCondition::And(items) if items.is_empty() => bail!("empty 'and' condition"),
            StepCondition::Or(items) if items.is_empty() => bail!("empty 'or' condition"),
            StepCondition::And(items) | StepCondition::Or(items) => {
                items.iter().try_for_each(StepCondition::validate)
            }
            StepCondition::Not(inner) => inner.validate(),
            StepCondition::Ref { step, query, .. } => match query.find_empty_group() {
                Some(operator) => bail!("empty '{operator}' in condition on '{step}'"),
                None => Ok(()),
            },
            StepCondition::Check(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for StepCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepCondition::Ref { step, path, query } => f
                .debug_struct("Ref")
                .field("step", step)
                .field("path", path)
                .field("query", query)
                .finish(),
            StepCondition::Check(_) => f.write_str("Check(..)"),
            StepCondition::And(items) => f.debug_tuple("And").field(items).finish(),
            StepCondition::Or(items) => f.debug_tuple("Or").field(items).finish(),
            StepCondition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
        }
    }
}
