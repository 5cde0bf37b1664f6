use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use stepchart::runtime::error::WorkflowError;
use stepchart::workflow::{
    MemorySnapshotStore, Predicate, RunResult, RunStatus, SnapshotStore, Step, StepCondition, StepOptions,
    StepResult, UnmetPolicy, VarRef, Workflow, WorkflowInstance,
};

fn store() -> Arc<MemorySnapshotStore> {
    Arc::new(MemorySnapshotStore::new())
}

fn echo(id: &str) -> Step {
    let id = id.to_string();
    Step::new(id.clone(), move |_| {
        let id = id.clone();
        async move { Ok(json!({ "ran": id })) }
    })
}

fn counted(id: &str, counter: &Arc<AtomicUsize>) -> Step {
    let counter = counter.clone();
    Step::new(id, move |_| {
        let runs = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(json!({ "runs": runs })) }
    })
}

async fn start(run: &WorkflowInstance, trigger: Value) -> RunResult {
    tokio::time::timeout(Duration::from_secs(5), run.start(trigger))
        .await
        .expect("run did not settle")
        .expect("run failed to execute")
}

async fn resume(run: &WorkflowInstance, step: &str, payload: Value) -> RunResult {
    tokio::time::timeout(Duration::from_secs(5), run.resume(step, payload))
        .await
        .expect("resume did not settle")
        .expect("resume failed to execute")
}

fn success(result: &RunResult, step: &str) -> Value {
    match result.results.get(step) {
        Some(StepResult::Success { output }) => output.clone(),
        other => panic!("step '{step}' did not succeed: {other:?}"),
    }
}

#[tokio::test]
async fn sequential_steps_share_trigger_data_and_outputs() {
    let first = Step::new("A", |ctx| {
        let x = ctx.trigger_data()["x"].as_i64().unwrap_or(0);
        async move { Ok(json!({ "doubled": x * 2 })) }
    });
    let second = Step::new("B", |ctx| {
        let doubled = ctx.step_output("A").map(|output| output["doubled"].clone());
        async move { Ok(json!({ "seen": doubled })) }
    });
    let workflow = Workflow::builder("sequential").step(first).then(second).commit().unwrap();

    let run = workflow.create_run(store());
    let result = start(&run, json!({ "x": 1 })).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(success(&result, "A"), json!({ "doubled": 2 }));
    assert_eq!(success(&result, "B"), json!({ "seen": 2 }));
    assert!(result.suspended.is_empty());
    assert_eq!(result.run_id, run.run_id());
}

#[tokio::test]
async fn suspended_step_resumes_with_payload() {
    let runs = Arc::new(AtomicUsize::new(0));
    let handler_runs = runs.clone();
    let approve = Step::new("approve", move |ctx| {
        handler_runs.fetch_add(1, Ordering::SeqCst);
        async move {
            if let Some(payload) = ctx.resume_payload() {
                return Ok(json!({ "approved": payload["approved"].clone() }));
            }
            ctx.suspend(json!({ "note": "waiting for approval" })).await;
            Ok(Value::Null)
        }
    });
    let archived = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("approval")
        .step(echo("prepare"))
        .then(approve)
        .then(counted("archive", &archived))
        .commit()
        .unwrap();

    let store = store();
    let run = workflow.create_run(store.clone());
    let suspended = start(&run, json!({ "order": 42 })).await;

    assert_eq!(suspended.status, RunStatus::Suspended);
    assert_eq!(
        suspended.results["approve"],
        StepResult::Suspended {
            payload: json!({ "note": "waiting for approval" })
        }
    );
    assert!(!suspended.results.contains_key("archive"));
    let state = store.load("approval", run.run_id()).await.unwrap().expect("run was persisted");
    assert_eq!(state.suspended_steps["approve"], "root");
    assert_eq!(state.trigger_data, json!({ "order": 42 }));

    let resumed = resume(&run, "approve", json!({ "approved": true })).await;
    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(success(&resumed, "approve"), json!({ "approved": true }));
    assert_eq!(success(&resumed, "archive"), json!({ "runs": 1 }));
    assert!(resumed.suspended.is_empty());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(archived.load(Ordering::SeqCst), 1);

    let state = run.state().await.unwrap().expect("run was persisted");
    assert!(state.suspended_steps.is_empty());
}

#[tokio::test]
async fn until_loop_runs_body_until_condition_holds() {
    let evaluations = Arc::new(AtomicUsize::new(0));
    let seen = evaluations.clone();
    let condition = StepCondition::check(move |_, _| Ok(seen.fetch_add(1, Ordering::SeqCst) >= 3));
    let polls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("polling")
        .step(echo("start"))
        .until(condition, counted("poll", &polls))
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), Value::Null).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
    assert_eq!(evaluations.load(Ordering::SeqCst), 4);
    assert_eq!(success(&result, "poll"), json!({ "runs": 3 }));
    assert_eq!(success(&result, "__poll_until_finished"), json!({ "finished": true }));
    assert_eq!(
        success(&result, "__poll_until_check"),
        json!({ "status": "complete" })
    );
}

#[tokio::test]
async fn while_loop_skips_body_when_condition_is_false() {
    let polls = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("never")
        .step(echo("start"))
        .while_(StepCondition::trigger("again", Predicate::eq(true)), counted("poll", &polls))
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), json!({ "again": false })).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(polls.load(Ordering::SeqCst), 0);
    assert_eq!(result.results["poll"], StepResult::Skipped);
    assert_eq!(success(&result, "__poll_while_finished"), json!({ "finished": true }));
}

#[tokio::test]
async fn failing_step_exhausts_retries_then_fails_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let attempts = calls.clone();
    let flaky = Step::new("flaky", move |_| {
        let call = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Err::<Value, _>(anyhow::anyhow!("boom on call {call}")) }
    });
    let downstream = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("retries")
        .step_with(flaky, StepOptions::new().retry(2, Some(Duration::from_millis(10))))
        .then(counted("after", &downstream))
        .commit()
        .unwrap();

    let run = workflow.create_run(store());
    let result = start(&run, Value::Null).await;

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
    match &result.results["flaky"] {
        StepResult::Failed { error } => assert!(error.contains("boom on call 3"), "{error}"),
        other => panic!("expected failure, got {other:?}"),
    }

    let state = run.state().await.unwrap().expect("run was persisted");
    let root = state.root_snapshot.as_ref().expect("root branch persisted");
    assert_eq!(root.context["attempts"]["flaky"], json!(-1));
    assert_eq!(root.value, json!({ "flaky": "failed" }));
    assert_eq!(
        state.results()["flaky"],
        StepResult::Failed {
            error: "boom on call 3".into()
        }
    );
}

#[tokio::test]
async fn if_else_runs_only_the_matching_branch() {
    let high = Arc::new(AtomicUsize::new(0));
    let low = Arc::new(AtomicUsize::new(0));
    let score = Step::new("score", |ctx| {
        let value = ctx.trigger_data()["score"].clone();
        async move { Ok(json!({ "value": value })) }
    });
    let workflow = Workflow::builder("grading")
        .step(score)
        .if_(StepCondition::step("score", "value", Predicate::gt(5)))
        .then(counted("high", &high))
        .else_()
        .then(counted("low", &low))
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), json!({ "score": 7 })).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(high.load(Ordering::SeqCst), 1);
    assert_eq!(low.load(Ordering::SeqCst), 0);
    assert_eq!(result.results["__score_else"], StepResult::Skipped);
    assert!(!result.results.contains_key("low"));

    let result = start(&workflow.create_run(store()), json!({ "score": 2 })).await;
    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(high.load(Ordering::SeqCst), 1);
    assert_eq!(low.load(Ordering::SeqCst), 1);
    assert_eq!(result.results["__score_if"], StepResult::Skipped);
}

#[tokio::test]
async fn after_all_runs_dependents_once_both_parents_finish() {
    let joined = Arc::new(AtomicUsize::new(0));
    let counter = joined.clone();
    let join = Step::new("join", move |ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        let left = ctx.step_output("left").cloned();
        let right = ctx.step_output("right").cloned();
        async move { Ok(json!({ "left": left, "right": right })) }
    });
    let slow = Step::new("right", |_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(json!("slow"))
    });
    let workflow = Workflow::builder("fan-in")
        .step(echo("left"))
        .step(slow)
        .after_all(&["left", "right"])
        .step(join)
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), Value::Null).await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(joined.load(Ordering::SeqCst), 1);
    assert_eq!(
        success(&result, "join"),
        json!({ "left": { "ran": "left" }, "right": "slow" })
    );
}

#[tokio::test]
async fn after_runs_subscriber_chains_in_parallel() {
    let workflow = Workflow::builder("fan-out")
        .step(echo("source"))
        .after("source")
        .step(echo("email"))
        .step(echo("sms"))
        .then(echo("receipt"))
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), Value::Null).await;

    assert_eq!(result.status, RunStatus::Completed);
    for step in ["source", "email", "sms", "receipt"] {
        assert_eq!(success(&result, step), json!({ "ran": step }));
    }
}

#[tokio::test]
async fn variables_bind_step_outputs_and_trigger_data() {
    let fetch = Step::new("fetch", |_| async { Ok(json!({ "user": { "name": "ada" } })) });
    let greet = Step::new("greet", |ctx| {
        let input = ctx.input().clone();
        async move {
            let name = input["name"].as_str().unwrap_or("nobody");
            let region = input["region"].as_str().unwrap_or("nowhere");
            Ok(json!(format!("hello {name} from {region}")))
        }
    });
    let workflow = Workflow::builder("bindings")
        .step(fetch)
        .then_with(
            greet,
            StepOptions::new()
                .variable("name", VarRef::step("fetch", "user.name"))
                .variable("region", VarRef::trigger("region")),
        )
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), json!({ "region": "eu" })).await;
    assert_eq!(success(&result, "greet"), json!("hello ada from eu"));
}

#[tokio::test]
async fn unmet_conditions_follow_their_policy() {
    let gated = || StepOptions::new().when(StepCondition::trigger("enabled", Predicate::eq(true)));

    let skipped_next = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("skip")
        .step_with(echo("gate"), gated().on_unmet(UnmetPolicy::SkipToCompleted))
        .then(counted("next", &skipped_next))
        .commit()
        .unwrap();
    let result = start(&workflow.create_run(store()), json!({ "enabled": false })).await;
    assert_eq!(result.results["gate"], StepResult::Skipped);
    assert_eq!(skipped_next.load(Ordering::SeqCst), 1);
    assert_eq!(result.status, RunStatus::Completed);

    let limbo_next = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("limbo")
        .step_with(echo("gate"), gated().on_unmet(UnmetPolicy::Limbo))
        .then(counted("next", &limbo_next))
        .commit()
        .unwrap();
    let result = start(&workflow.create_run(store()), json!({ "enabled": false })).await;
    assert_eq!(result.results["gate"], StepResult::Skipped);
    assert_eq!(limbo_next.load(Ordering::SeqCst), 0);

    let subscribers = Arc::new(AtomicUsize::new(0));
    let workflow = Workflow::builder("auto")
        .step_with(echo("gate"), gated())
        .after("gate")
        .step(counted("follow", &subscribers))
        .commit()
        .unwrap();
    let result = start(&workflow.create_run(store()), json!({ "enabled": false })).await;
    assert_eq!(result.results["gate"], StepResult::Skipped);
    assert_eq!(subscribers.load(Ordering::SeqCst), 1);

    let result = start(&workflow.create_run(store()), json!({ "enabled": true })).await;
    assert_eq!(success(&result, "gate"), json!({ "ran": "gate" }));
    assert_eq!(subscribers.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn named_events_resume_after_event_steps() {
    let ship = Step::new("ship", |ctx| {
        let paid = ctx
            .step_output("__payment_event")
            .map(|output| output["resumedEvent"]["amount"].clone());
        async move { Ok(json!({ "paid": paid })) }
    });
    let workflow = Workflow::builder("checkout")
        .step(echo("order"))
        .after_event("payment")
        .then(ship)
        .commit()
        .unwrap();

    let run = workflow.create_run(store());
    let waiting = start(&run, Value::Null).await;
    assert_eq!(waiting.status, RunStatus::Suspended);
    assert_eq!(waiting.suspended["__payment_event"], "root");
    assert_eq!(
        waiting.results["__payment_event"],
        StepResult::Suspended {
            payload: json!({ "event": "payment" })
        }
    );

    let done = tokio::time::timeout(
        Duration::from_secs(5),
        run.resume_with_event("payment", json!({ "amount": 10 })),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(success(&done, "ship"), json!({ "paid": 10 }));
}

#[tokio::test]
async fn resuming_a_step_that_is_not_suspended_is_rejected() {
    let workflow = Workflow::builder("plain").step(echo("only")).commit().unwrap();
    let run = workflow.create_run(store());

    let err = run.resume("only", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::RunNotFound { .. }));

    start(&run, Value::Null).await;
    let err = run.resume("only", Value::Null).await.unwrap_err();
    assert!(matches!(err, WorkflowError::NotSuspended(step) if step == "only"));
}

#[tokio::test]
async fn condition_errors_fail_the_step_not_the_run() {
    let workflow = Workflow::builder("bad-regex")
        .step_with(
            echo("check"),
            StepOptions::new().when(StepCondition::trigger("name", Predicate::Regex("(".into()))),
        )
        .commit()
        .unwrap();

    let result = start(&workflow.create_run(store()), json!({ "name": "x" })).await;
    assert_eq!(result.status, RunStatus::Failed);
    match &result.results["check"] {
        StepResult::Failed { error } => assert!(error.contains("condition evaluation failed")),
        other => panic!("expected failure, got {other:?}"),
    }
}
