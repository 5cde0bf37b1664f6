//! Lowering step graphs into statecharts
//!
//! Every chain becomes one region of a parallel root. A step is a compound
//! state cycling through fixed sub-states:
//!
//! ```text
//! pending -> executing -> runningSubscribers -> <next step> | completed
//!    |           |  \
//!    |           |   -> waiting -> pending        (retry)
//!    |           -> suspended | failed
//!    -> limbo | completed | failed | suspended    (condition routing)
//! ```
//!
//! The next step of a chain is nested inside its predecessor, so the state
//! value of a region is a path ending at the sub-state of its current step.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value, json};

use super::graph::{StepGraph, StepNode};
use super::instance::RunShared;
use crate::machine::{Action, Guard, Implementations, InvokeConfig, MachineConfig, StateConfig, StateMachine, TransitionConfig};
use crate::runtime::error::MachineResult;
use crate::runtime::event::Event;
use crate::runtime::logic::FutureLogic;

/// Id of the root node of every branch machine
pub const MACHINE_ID: &str = "workflow";

/// Sub-states in which a step stays until something resumes it
pub const TERMINAL_STATES: [&str; 4] = ["completed", "failed", "suspended", "limbo"];

/// Statechart for the chains of one branch
pub(crate) fn compile_branch(run: &Arc<RunShared>, branch: &str, graph: &StepGraph) -> MachineResult<StateMachine> {
    let mut root = StateConfig::parallel();
    for chain in graph.chains() {
        if let Some((head, rest)) = chain.split_first() {
            root = root.state(head.id(), step_state(run, branch, head, rest));
        }
    }
    let attempts: Map<String, Value> = graph
        .nodes()
        .map(|node| (node.id().to_string(), json!(node.options.retry.attempts)))
        .collect();
    let attempts = Value::Object(attempts);
    let config = MachineConfig::new(MACHINE_ID, root).context_from_input(move |input| {
        json!({
            "steps": input.get("steps").cloned().unwrap_or_else(|| json!({})),
            "triggerData": input.get("triggerData").cloned().unwrap_or(Value::Null),
            "attempts": attempts.clone(),
        })
    });
    StateMachine::new(config, Implementations::new())
}

/// Node id of a step's `pending` sub-state
pub(crate) fn pending_target(graph: &StepGraph, step_id: &str) -> Option<String> {
    let path = graph.path_to(step_id)?;
    Some(format!("{MACHINE_ID}.{}.pending", path.join(".")))
}

/// Whether every region rests in a terminal sub-state
pub fn settled(value: &Value) -> bool {
    match value {
        Value::Object(regions) => regions.values().all(leaf_settled),
        other => leaf_settled(other),
    }
}

fn leaf_settled(value: &Value) -> bool {
    match value {
        Value::String(state) => TERMINAL_STATES.contains(&state.as_str()),
        Value::Object(map) if map.len() == 1 => map.values().all(leaf_settled),
        _ => false,
    }
}

fn step_state(run: &Arc<RunShared>, branch: &str, node: &StepNode, rest: &[StepNode]) -> StateConfig {
    let id = node.id().to_string();
    let next = rest.first().map_or_else(|| "completed".to_string(), |next| next.id().to_string());
    let delay = node
        .options
        .retry
        .delay
        .unwrap_or(Duration::from_millis(run.config.default_retry_delay_ms));

    let mut check = InvokeConfig::logic(format!("check:{id}"), check_logic(run, node)).id(format!("check:{id}"));
    for (outcome, target) in [
        ("executing", "executing"),
        ("completed", next.as_str()),
        ("runningSubscribers", "runningSubscribers"),
        ("limbo", "limbo"),
        ("suspended", "suspended"),
        ("failed", "failed"),
    ] {
        check = check.on_done(
            TransitionConfig::to(target)
                .guard(outcome_is(outcome))
                .action(mirror_result(&id)),
        );
    }
    let check = check.on_error(
        TransitionConfig::to("failed")
            .action(mirror_failure(&id))
            .action(record_failure(run, &id)),
    );

    let execute = InvokeConfig::logic(format!("exec:{id}"), exec_logic(run, branch, node))
        .id(format!("exec:{id}"))
        .on_done(
            TransitionConfig::to("suspended")
                .guard(Guard::new("suspended", |_, event| {
                    Ok(event.output().and_then(|output| output.get("suspended")) == Some(&Value::Bool(true)))
                }))
                .action(mirror_result(&id)),
        )
        .on_done(TransitionConfig::to("runningSubscribers").action(mirror_result(&id)))
        .on_error(
            TransitionConfig::to("waiting")
                .guard(attempts_left(&id))
                .action(consume_attempt(&id))
                .action(log_retry(&id)),
        )
        .on_error(
            TransitionConfig::to("failed")
                .action(consume_attempt(&id))
                .action(mirror_failure(&id))
                .action(record_failure(run, &id)),
        );

    let subscribers = InvokeConfig::logic(format!("subs:{id}"), subscribers_logic(run, &id))
        .id(format!("subs:{id}"))
        .on_done(TransitionConfig::to(next.as_str()).action(merge_steps()))
        .on_error(TransitionConfig::to(next.as_str()).action(log_subscriber_error(&id)));

    let mut state = StateConfig::compound("pending")
        .state("pending", StateConfig::atomic().invoke(check))
        .state(
            "waiting",
            StateConfig::atomic().after(delay, TransitionConfig::to("pending")),
        )
        .state("executing", StateConfig::atomic().invoke(execute))
        .state("runningSubscribers", StateConfig::atomic().invoke(subscribers))
        .state("completed", StateConfig::final_state())
        .state("failed", StateConfig::final_state())
        .state("suspended", StateConfig::final_state())
        .state("limbo", StateConfig::final_state());
    if let Some((following, tail)) = rest.split_first() {
        state = state.state(following.id(), step_state(run, branch, following, tail));
    }
    state
}

fn check_logic(run: &Arc<RunShared>, node: &StepNode) -> Arc<FutureLogic> {
    let (run, node) = (run.clone(), node.clone());
    Arc::new(FutureLogic::new(move |_| {
        let outcome = run.check(&node);
        async move { Ok(outcome) }
    }))
}

fn exec_logic(run: &Arc<RunShared>, branch: &str, node: &StepNode) -> Arc<FutureLogic> {
    let (run, node, branch) = (run.clone(), node.clone(), branch.to_string());
    Arc::new(FutureLogic::new(move |_| run.clone().execute(node.clone(), branch.clone())))
}

fn subscribers_logic(run: &Arc<RunShared>, step_id: &str) -> Arc<FutureLogic> {
    let (run, step_id) = (run.clone(), step_id.to_string());
    Arc::new(FutureLogic::new(move |_| run.clone().run_subscribers(step_id.clone())))
}

fn outcome_is(outcome: &'static str) -> Guard {
    Guard::new(format!("outcome:{outcome}"), move |_, event| {
        Ok(event
            .output()
            .and_then(|output| output.get("outcome"))
            .and_then(Value::as_str)
            == Some(outcome))
    })
}

fn attempts_left(step_id: &str) -> Guard {
    let step_id = step_id.to_string();
    Guard::new(format!("attemptsLeft:{step_id}"), move |context, _| {
        Ok(context["attempts"][&step_id].as_i64().unwrap_or(0) > 0)
    })
}

fn with_step(context: &Value, step_id: &str, result: Value) -> Value {
    let mut steps = context
        .get("steps")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    steps.insert(step_id.to_string(), result);
    json!({ "steps": steps })
}

fn mirror_result(step_id: &str) -> Action {
    let step_id = step_id.to_string();
    Action::assign(move |context, event| {
        match event.output().and_then(|output| output.get("result")) {
            Some(result) => with_step(context, &step_id, result.clone()),
            None => json!({}),
        }
    })
}

fn failure_message(event: &Event) -> String {
    event.error_message().unwrap_or_else(|| "step failed".to_string())
}

fn mirror_failure(step_id: &str) -> Action {
    let step_id = step_id.to_string();
    Action::assign(move |context, event| {
        with_step(
            context,
            &step_id,
            json!({ "status": "failed", "error": failure_message(event) }),
        )
    })
}

fn record_failure(run: &Arc<RunShared>, step_id: &str) -> Action {
    let (run, step_id) = (run.clone(), step_id.to_string());
    Action::effect(move |_, event| run.record_failure(&step_id, failure_message(event)))
}

fn consume_attempt(step_id: &str) -> Action {
    let step_id = step_id.to_string();
    Action::assign(move |context, _| {
        let mut attempts = context
            .get("attempts")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let left = attempts.get(&step_id).and_then(Value::as_i64).unwrap_or(0);
        attempts.insert(step_id.clone(), json!(left - 1));
        json!({ "attempts": attempts })
    })
}

fn log_retry(step_id: &str) -> Action {
    let step_id = step_id.to_string();
    Action::log(move |context, event| {
        format!(
            "step '{step_id}' failed ({}), {} retries left",
            failure_message(event),
            context["attempts"][&step_id].as_i64().unwrap_or(0) - 1
        )
    })
}

fn log_subscriber_error(step_id: &str) -> Action {
    let step_id = step_id.to_string();
    Action::log(move |_, event| format!("subscribers of '{step_id}' failed: {}", failure_message(event)))
}

fn merge_steps() -> Action {
    Action::assign(|context, event| {
        let mut steps = context
            .get("steps")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        if let Some(update) = event
            .output()
            .and_then(|output| output.get("steps"))
            .and_then(Value::as_object)
        {
            steps.extend(update.clone());
        }
        json!({ "steps": steps })
    })
}
