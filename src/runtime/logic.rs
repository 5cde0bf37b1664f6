//! Built-in actor logics
//!
//! `ReducerLogic` folds events into its context. `FutureLogic` runs an async
//! computation on tokio and reports the result back to itself as an ordinary
//! event, which finishes the actor as `done` or `error`.

use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use super::actor::{ActorLogic, ActorRef, ActorScope};
use super::error::{ActorError, ActorResult};
use super::event::Event;
use super::snapshot::{Snapshot, SnapshotStatus};

const RESOLVE: &str = "stepchart.future.resolve";
const REJECT: &str = "stepchart.future.reject";
const NO_RUNTIME: &str = "stepchart.future.no-runtime";

type ReduceFn = dyn Fn(&Value, &Event) -> Value + Send + Sync;

/// Actor whose context is folded over received events
pub struct ReducerLogic {
    initial: Value,
    reduce: Arc<ReduceFn>,
}

impl ReducerLogic {
    /// Create a reducer; a non-null actor input replaces `initial`
    pub fn new(initial: Value, reduce: impl Fn(&Value, &Event) -> Value + Send + Sync + 'static) -> Self {
        Self {
            initial,
            reduce: Arc::new(reduce),
        }
    }
}

impl ActorLogic for ReducerLogic {
    fn initial_snapshot(&self, _scope: &mut ActorScope<'_>, input: Value) -> ActorResult<Snapshot> {
        let context = if input.is_null() { self.initial.clone() } else { input };
        Ok(Snapshot::new(context))
    }

    fn transition(
        &self,
        snapshot: &Snapshot,
        event: &Event,
        _scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot> {
        let mut next = snapshot.clone();
        if event.is_stop() {
            next.status = SnapshotStatus::Stopped;
        } else {
            next.context = (self.reduce)(&snapshot.context, event);
        }
        Ok(next)
    }
}

type RunFn = dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// Actor backed by a single async computation over its input
///
/// The input is kept as context, so a restored actor that had not settled
/// runs its computation again.
pub struct FutureLogic {
    run: Arc<RunFn>,
}

impl FutureLogic {
    /// Wrap an async function of the actor input
    pub fn new<F, Fut>(run: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            run: Arc::new(move |input| run(input).boxed()),
        }
    }
}

impl ActorLogic for FutureLogic {
    fn initial_snapshot(&self, _scope: &mut ActorScope<'_>, input: Value) -> ActorResult<Snapshot> {
        Ok(Snapshot::new(input))
    }

    fn start(&self, snapshot: &Snapshot, scope: &mut ActorScope<'_>) {
        if snapshot.status != SnapshotStatus::Active {
            return;
        }
        let me: ActorRef = scope.self_ref().clone();
        if tokio::runtime::Handle::try_current().is_err() {
            scope.send(&me, Event::new(NO_RUNTIME));
            return;
        }

        let work = (self.run)(snapshot.context.clone());
        scope.spawn_task(
            async move {
                let event = match work.await {
                    Ok(output) => Event::new(RESOLVE).with("output", output),
                    Err(err) => Event::new(REJECT).with("error", Value::String(format!("{err:#}"))),
                };
                me.send(event);
            }
            .boxed(),
        );
    }

    fn transition(
        &self,
        snapshot: &Snapshot,
        event: &Event,
        scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot> {
        if snapshot.status != SnapshotStatus::Active {
            return Ok(snapshot.clone());
        }
        let mut next = snapshot.clone();
        match event.event_type() {
            NO_RUNTIME => return Err(ActorError::NoAsyncRuntime(scope.self_ref().id().to_string())),
            RESOLVE => {
                next.status = SnapshotStatus::Done;
                next.output = Some(event.output().cloned().unwrap_or(Value::Null));
            }
            REJECT => {
                next.status = SnapshotStatus::Error;
                next.error = event.error_message();
            }
            _ if event.is_stop() => next.status = SnapshotStatus::Stopped,
            _ => {}
        }
        Ok(next)
    }
}
