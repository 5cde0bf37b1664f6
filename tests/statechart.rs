use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

use stepchart::machine::{Action, Guard, HistoryKind, Implementations, InvokeConfig};
use stepchart::runtime::actor::{ActorLogic, Observer};
use stepchart::runtime::error::{ActorError, MachineError};
use stepchart::runtime::inspect::{InspectionEvent, RecordingInspector};
use stepchart::runtime::logic::ReducerLogic;
use stepchart::runtime::snapshot::SnapshotStatus;
use stepchart::{
    Actor, ActorRef, Event, MachineConfig, RuntimeConfig, Snapshot, StateConfig, StateMachine, System,
    TransitionConfig,
};

fn compile(config: MachineConfig) -> Arc<StateMachine> {
    Arc::new(StateMachine::new(config, Implementations::new()).unwrap())
}

fn started(machine: Arc<StateMachine>) -> ActorRef {
    let actor = Actor::root(machine, Value::Null);
    actor.start();
    actor
}

fn send_all(actor: &ActorRef, events: &[&str]) {
    for event in events {
        actor.send(Event::new(*event));
    }
}

fn editor(history: HistoryKind) -> Arc<StateMachine> {
    let editing = StateConfig::parallel()
        .state(
            "text",
            StateConfig::compound("plain")
                .state("plain", StateConfig::atomic().on("BOLD", TransitionConfig::to("bold")))
                .state("bold", StateConfig::atomic()),
        )
        .state(
            "mode",
            StateConfig::compound("insert")
                .state("insert", StateConfig::atomic().on("VISUAL", TransitionConfig::to("visual")))
                .state("visual", StateConfig::atomic()),
        );
    let root = StateConfig::compound("work")
        .state(
            "work",
            StateConfig::compound("editing")
                .state("editing", editing.on("SUBMIT", TransitionConfig::to("reviewing")))
                .state("reviewing", StateConfig::atomic())
                .state("hist", StateConfig::history(history))
                .on("PAUSE", TransitionConfig::to("paused")),
        )
        .state("paused", StateConfig::atomic().on("RESUME", TransitionConfig::to("work.hist")));
    compile(MachineConfig::new("editor", root))
}

#[test]
fn deep_history_restores_nested_parallel_leaves() {
    let actor = started(editor(HistoryKind::Deep));
    send_all(&actor, &["BOLD", "VISUAL"]);
    let before = actor.snapshot().value;
    assert_eq!(before, json!({"work": {"editing": {"text": "bold", "mode": "visual"}}}));

    actor.send(Event::new("PAUSE"));
    assert_eq!(actor.snapshot().value, json!("paused"));
    actor.send(Event::new("RESUME"));
    assert_eq!(actor.snapshot().value, before);
}

#[test]
fn shallow_history_restores_only_the_direct_child() {
    let actor = started(editor(HistoryKind::Shallow));
    send_all(&actor, &["BOLD", "VISUAL", "PAUSE", "RESUME"]);
    assert_eq!(
        actor.snapshot().value,
        json!({"work": {"editing": {"text": "plain", "mode": "insert"}}})
    );

    send_all(&actor, &["SUBMIT", "PAUSE", "RESUME"]);
    assert_eq!(actor.snapshot().value, json!({"work": "reviewing"}));
}

#[test]
fn history_without_record_enters_its_default() {
    let root = StateConfig::compound("off")
        .state("off", StateConfig::atomic().on("ON", TransitionConfig::to("on.last")))
        .state(
            "on",
            StateConfig::compound("low")
                .state("low", StateConfig::atomic())
                .state("high", StateConfig::atomic())
                .state(
                    "last",
                    StateConfig::history_with_default(HistoryKind::Shallow, TransitionConfig::to("high")),
                ),
        );
    let actor = started(compile(MachineConfig::new("dimmer", root)));
    actor.send(Event::new("ON"));
    assert_eq!(actor.snapshot().value, json!({"on": "high"}));
}

fn conflicting(handler_first: bool, idle_regions: usize) -> Arc<StateMachine> {
    let handler = StateConfig::compound("a1")
        .state("a1", StateConfig::atomic().on("E", TransitionConfig::to("a2")))
        .state("a2", StateConfig::atomic());
    let idle = StateConfig::compound("b1").state("b1", StateConfig::atomic());

    let mut parallel = StateConfig::parallel();
    if handler_first {
        parallel = parallel.state("handler", handler.clone());
    }
    for index in 0..idle_regions {
        parallel = parallel.state(format!("idle{index}"), idle.clone());
    }
    if !handler_first {
        parallel = parallel.state("handler", handler);
    }
    let root = StateConfig::compound("p")
        .state("p", parallel.on("E", TransitionConfig::to("left")))
        .state("left", StateConfig::atomic());
    compile(MachineConfig::new("conflict", root))
}

proptest! {
    #[test]
    fn descendant_transition_wins_regardless_of_order(handler_first in any::<bool>(), idle_regions in 1usize..4) {
        let actor = started(conflicting(handler_first, idle_regions));
        actor.send(Event::new("E"));
        let snapshot = actor.snapshot();
        prop_assert_eq!(&snapshot.value["p"]["handler"], &json!("a2"));
        prop_assert_eq!(snapshot.value["p"].as_object().map(|regions| regions.len()), Some(idle_regions + 1));
    }
}

fn equal_priority(first: &str, second: &str) -> Arc<StateMachine> {
    let region = |target: &str| {
        StateConfig::compound("idle").state(
            "idle",
            StateConfig::atomic().on("E", TransitionConfig::to(format!("#race.{target}"))),
        )
    };
    let root = StateConfig::compound("p")
        .state("p", StateConfig::parallel().state(first, region(first)).state(second, region(second)))
        .state("x", StateConfig::atomic())
        .state("y", StateConfig::atomic());
    compile(MachineConfig::new("race", root))
}

#[test]
fn equal_priority_conflicts_keep_document_order() {
    let system = System::new();
    let recorder = Arc::new(RecordingInspector::new());
    system.add_inspector(recorder.clone());
    let actor = Actor::root_in(&system, "race", equal_priority("x", "y"), Value::Null);
    actor.start();
    actor.send(Event::new("E"));
    assert_eq!(actor.snapshot().value, json!("x"));

    let taken: Vec<Vec<String>> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            InspectionEvent::MicrostepTaken { transitions, .. } => Some(transitions),
            _ => None,
        })
        .collect();
    assert_eq!(taken, vec![vec!["race.p.x.idle".to_string()]]);

    let actor = started(equal_priority("y", "x"));
    actor.send(Event::new("E"));
    assert_eq!(actor.snapshot().value, json!("y"));
}

#[tokio::test]
async fn delayed_transitions_fire_and_are_cancelled_on_exit() {
    let root = || {
        StateConfig::compound("waiting")
            .state(
                "waiting",
                StateConfig::atomic()
                    .after(Duration::from_millis(30), TransitionConfig::to("expired"))
                    .on("LEAVE", TransitionConfig::to("left")),
            )
            .state("expired", StateConfig::atomic())
            .state("left", StateConfig::atomic())
    };

    let expiring = started(compile(MachineConfig::new("timeout", root())));
    let timers = expiring.system().scheduled_events();
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].event.event_type(), "after.30.timeout.waiting");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(expiring.snapshot().value, json!("expired"));

    let leaving = started(compile(MachineConfig::new("timeout", root())));
    leaving.send(Event::new("LEAVE"));
    assert!(leaving.system().scheduled_events().is_empty());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(leaving.snapshot().value, json!("left"));
}

#[tokio::test]
async fn persisted_timers_are_rearmed_on_restore() {
    let root = StateConfig::compound("waiting")
        .state(
            "waiting",
            StateConfig::atomic().after(Duration::from_millis(40), TransitionConfig::to("expired")),
        )
        .state("expired", StateConfig::final_state());
    let machine = compile(MachineConfig::new("lease", root));

    let original = started(machine.clone());
    let persisted = original.persisted_snapshot();
    original.stop().unwrap();
    assert_eq!(persisted.scheduled.len(), 1);
    assert_eq!(persisted.scheduled[0].source, "root");

    let restored = Actor::restore(machine, persisted);
    restored.start();
    assert_eq!(restored.system().scheduled_events().len(), 1);
    tokio::time::sleep(Duration::from_millis(120)).await;
    let snapshot = restored.snapshot();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert_eq!(snapshot.value, json!("expired"));
}

#[test]
fn final_states_produce_done_events_and_output() {
    let root = StateConfig::compound("task")
        .state(
            "task",
            StateConfig::compound("working")
                .state(
                    "working",
                    StateConfig::atomic().on(
                        "ADD",
                        TransitionConfig::internal().action(Action::assign(|context, event| {
                            let total = context["total"].as_i64().unwrap_or(0);
                            json!({"total": total + event.get("amount").and_then(Value::as_i64).unwrap_or(0)})
                        })),
                    ),
                )
                .state("finished", StateConfig::final_state())
                .on("FINISH", TransitionConfig::to(".finished"))
                .on_done(TransitionConfig::to("review")),
        )
        .state("review", StateConfig::atomic().on("APPROVE", TransitionConfig::to("approved")))
        .state(
            "approved",
            StateConfig::final_state().output(|context, _| json!({"total": context["total"].clone()})),
        );
    let actor = started(compile(MachineConfig::new("invoice", root).context(json!({"total": 0}))));

    actor.send(Event::new("ADD").with("amount", json!(2)));
    actor.send(Event::new("ADD").with("amount", json!(1)));
    actor.send(Event::new("FINISH"));
    assert_eq!(actor.snapshot().value, json!("review"));

    actor.send(Event::new("APPROVE"));
    let snapshot = actor.snapshot();
    assert_eq!(snapshot.status, SnapshotStatus::Done);
    assert_eq!(snapshot.output, Some(json!({"total": 3})));
    assert!(actor.is_stopped());
}

#[test]
fn machine_output_mapper_sees_the_done_event() {
    let root = StateConfig::compound("go")
        .state("go", StateConfig::atomic().on("END", TransitionConfig::to("end")))
        .state("end", StateConfig::final_state().output(|_, _| json!("raw")));
    let config = MachineConfig::new("mapped", root)
        .output(|_, event| json!({"from": event.event_type(), "raw": event.output().cloned()}));
    let actor = started(compile(config));
    actor.send(Event::new("END"));
    assert_eq!(
        actor.snapshot().output,
        Some(json!({"from": "done.state.mapped.end", "raw": "raw"}))
    );
}

struct Failures(Arc<Mutex<Vec<ActorError>>>);

impl Observer for Failures {
    fn next(&self, _snapshot: &Snapshot) {}

    fn error(&self, error: &ActorError) {
        self.0.lock().push(error.clone());
    }
}

#[test]
fn guard_errors_put_the_actor_in_error() {
    let root = StateConfig::compound("idle")
        .state(
            "idle",
            StateConfig::atomic().on(
                "CHECK",
                TransitionConfig::to("checked").guard(Guard::new("explodes", |_, _| anyhow::bail!("kaboom"))),
            ),
        )
        .state("checked", StateConfig::atomic());
    let actor = started(compile(MachineConfig::new("guarded", root)));
    let failures = Arc::new(Mutex::new(Vec::new()));
    actor.subscribe(Failures(failures.clone()));

    actor.send(Event::new("CHECK"));
    let snapshot = actor.snapshot();
    assert_eq!(snapshot.status, SnapshotStatus::Error);
    assert_eq!(snapshot.value, json!("idle"));
    let error = snapshot.error.unwrap_or_default();
    assert!(error.contains("Guard 'explodes'"), "{error}");
    assert!(error.contains("kaboom"), "{error}");
    assert_eq!(failures.lock().len(), 1);

    actor.send(Event::new("CHECK"));
    assert_eq!(actor.snapshot().value, json!("idle"));
}

#[test]
fn malformed_definitions_are_rejected_at_compile_time() {
    let cases = vec![
        StateConfig::compound("a").state(
            "a",
            StateConfig::atomic().on("GO", TransitionConfig::to("b").guard(Guard::named("missing"))),
        ),
        StateConfig::compound("a").state(
            "a",
            StateConfig::atomic().on("GO", TransitionConfig::to("b").guard(Guard::And(vec![]))),
        ),
        StateConfig::compound("a").state("a", StateConfig::atomic().on("GO", TransitionConfig::to("nowhere"))),
        StateConfig::compound("a").state("a", StateConfig::atomic().entry(Action::named("unknown"))),
        StateConfig::compound("missing").state("a", StateConfig::atomic()),
    ];
    for root in cases {
        let result = StateMachine::new(
            MachineConfig::new("bad", root.state("b", StateConfig::atomic())),
            Implementations::new(),
        );
        assert!(matches!(result, Err(MachineError::Configuration(_))));
    }

    let implementations = Implementations::new()
        .guard("ready", Guard::new("ready", |context, _| Ok(context["ready"] == json!(true))))
        .action("mark", Action::assign(|_, _| json!({"marked": true})));
    let root = StateConfig::compound("a")
        .state(
            "a",
            StateConfig::atomic().on(
                "GO",
                TransitionConfig::to("b")
                    .guard(Guard::named("ready"))
                    .action(Action::named("mark")),
            ),
        )
        .state("b", StateConfig::atomic());
    let machine = StateMachine::new(
        MachineConfig::new("named", root).context(json!({"ready": true})),
        implementations,
    )
    .unwrap();
    let actor = started(Arc::new(machine));
    actor.send(Event::new("GO"));
    assert_eq!(actor.snapshot().value, json!("b"));
    assert_eq!(actor.snapshot().context["marked"], json!(true));
}

#[test]
fn eventless_transitions_run_to_a_fixpoint() {
    let root = StateConfig::compound("counting").state(
        "counting",
        StateConfig::atomic().always(
            TransitionConfig::internal()
                .guard(Guard::new("below", |context, _| Ok(context["n"].as_i64().unwrap_or(0) < 5)))
                .action(Action::assign(|context, _| json!({"n": context["n"].as_i64().unwrap_or(0) + 1}))),
        ),
    );
    let actor = started(compile(MachineConfig::new("counter", root).context(json!({"n": 0}))));
    assert_eq!(actor.snapshot().context["n"], json!(5));
    assert_eq!(actor.snapshot().status, SnapshotStatus::Active);
}

#[test]
fn eventless_loops_hit_the_microstep_limit() {
    let root = StateConfig::compound("ping")
        .state("ping", StateConfig::atomic().always(TransitionConfig::to("pong")))
        .state("pong", StateConfig::atomic().always(TransitionConfig::to("ping")));
    let system = System::with_config(RuntimeConfig {
        max_microsteps: 50,
        ..RuntimeConfig::default()
    });
    let actor = Actor::root_in(&system, "loop", compile(MachineConfig::new("loop", root)), Value::Null);
    actor.start();

    let snapshot = actor.snapshot();
    assert_eq!(snapshot.status, SnapshotStatus::Error);
    assert_eq!(
        snapshot.error,
        Some(ActorError::Machine(MachineError::EventlessLoop { limit: 50 }).to_string())
    );
}

fn player() -> Arc<StateMachine> {
    let journal: Arc<dyn ActorLogic> = Arc::new(ReducerLogic::new(json!([]), |log, event| {
        let mut entries = log.as_array().cloned().unwrap_or_default();
        entries.push(json!(event.event_type()));
        Value::Array(entries)
    }));
    let count = |key: &'static str| {
        Action::assign(move |context, _| {
            let mut patch = serde_json::Map::new();
            patch.insert(key.to_string(), json!(context[key].as_i64().unwrap_or(0) + 1));
            Value::Object(patch)
        })
    };
    let root = StateConfig::compound("stopped")
        .invoke(InvokeConfig::logic("journal", journal).id("log"))
        .on("NOTE", TransitionConfig::internal().action(Action::send_to("log", Event::new("NOTE"))))
        .state("stopped", StateConfig::atomic().on("PLAY", TransitionConfig::to("playing")))
        .state(
            "playing",
            StateConfig::compound("normal")
                .entry(count("plays"))
                .state("normal", StateConfig::atomic().on("FAST", TransitionConfig::to("fast")))
                .state(
                    "fast",
                    StateConfig::atomic()
                        .tag("speedy")
                        .on("NORMAL", TransitionConfig::to("normal")),
                )
                .state("hist", StateConfig::history(HistoryKind::Deep))
                .on("STOP", TransitionConfig::to("stopped"))
                .on("PAUSE", TransitionConfig::to("paused").action(count("pauses"))),
        )
        .state("paused", StateConfig::atomic().on("PLAY", TransitionConfig::to("playing.hist")));
    compile(MachineConfig::new("player", root).context(json!({"plays": 0, "pauses": 0})))
}

const PLAYER_EVENTS: [&str; 6] = ["PLAY", "STOP", "PAUSE", "FAST", "NORMAL", "NOTE"];

proptest! {
    #[test]
    fn restore_of_persist_is_identical(events in prop::collection::vec(0usize..PLAYER_EVENTS.len(), 0..24)) {
        let machine = player();
        let original = started(machine.clone());
        for index in &events {
            original.send(Event::new(PLAYER_EVENTS[*index]));
        }
        let before = original.snapshot();
        let persisted = original.persisted_snapshot();
        let text = serde_json::to_string(&persisted).unwrap();

        let restored = Actor::restore(machine, serde_json::from_str(&text).unwrap());
        restored.start();
        let after = restored.snapshot();
        prop_assert_eq!(&after.value, &before.value);
        prop_assert_eq!(&after.context, &before.context);
        prop_assert_eq!(after.status, before.status);
        prop_assert_eq!(&after.tags, &before.tags);
        prop_assert_eq!(
            after.children["log"].snapshot().context,
            before.children["log"].snapshot().context
        );

        for event in ["PAUSE", "PLAY", "NOTE"] {
            original.send(Event::new(event));
            restored.send(Event::new(event));
        }
        prop_assert_eq!(restored.snapshot().value, original.snapshot().value);
        prop_assert_eq!(
            restored.snapshot().children["log"].snapshot().context,
            original.snapshot().children["log"].snapshot().context
        );
    }
}
