//! Branch machines
//!
//! One statechart actor per branch key, each in its own System. The driver
//! persists every committed snapshot and returns once all regions rest in
//! terminal sub-states.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::mpsc;

use super::compile::{compile_branch, settled};
use super::instance::RunShared;
use crate::runtime::actor::{Actor, ActorLogic, Observer};
use crate::runtime::error::{ActorError, WorkflowError, WorkflowResult};
use crate::runtime::snapshot::{PersistedSnapshot, Snapshot, SnapshotStatus};
use crate::runtime::system::System;

enum Signal {
    Snapshot(Snapshot),
    Error(ActorError),
    Complete,
}

struct BranchObserver {
    tx: mpsc::UnboundedSender<Signal>,
}

impl Observer for BranchObserver {
    fn next(&self, snapshot: &Snapshot) {
        let _ = self.tx.send(Signal::Snapshot(snapshot.clone()));
    }

    fn error(&self, error: &ActorError) {
        let _ = self.tx.send(Signal::Error(error.clone()));
    }

    fn complete(&self) {
        let _ = self.tx.send(Signal::Complete);
    }
}

/// Run the branch `key` until it settles, optionally from a persisted snapshot
pub(crate) fn run_branch(
    run: Arc<RunShared>,
    key: String,
    restore: Option<PersistedSnapshot>,
) -> BoxFuture<'static, WorkflowResult<Snapshot>> {
    async move {
        let graph = run.workflow.branch(&key).ok_or_else(|| WorkflowError::Configuration {
            workflow: run.workflow.name.clone(),
            detail: format!("no step graph for branch '{key}'"),
        })?;
        let logic: Arc<dyn ActorLogic> = Arc::new(compile_branch(&run, &key, graph)?);
        let system = System::with_config(run.config.clone());
        let restored = restore.is_some();
        let actor = match restore {
            Some(persisted) => Actor::restore_in(&system, &key, logic, persisted),
            None => {
                let input = json!({ "steps": run.results_json(), "triggerData": run.trigger_data() });
                Actor::root_in(&system, &key, logic, input)
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = actor.subscribe(BranchObserver { tx });
        tracing::debug!(run_id = %run.run_id, branch = %key, restored, "starting branch");
        actor.start();

        let outcome = loop {
            match rx.recv().await {
                Some(Signal::Snapshot(snapshot)) => {
                    if snapshot.status == SnapshotStatus::Error {
                        let detail = snapshot.error.clone().unwrap_or_default();
                        break Err(WorkflowError::Branch {
                            branch: key.clone(),
                            source: ActorError::Logic(detail),
                        });
                    }
                    run.persist_branch(&key, actor.persisted_snapshot()).await;
                    if snapshot.status.is_terminal() || settled(&snapshot.value) {
                        break Ok(snapshot);
                    }
                }
                Some(Signal::Error(source)) => {
                    break Err(WorkflowError::Branch {
                        branch: key.clone(),
                        source,
                    });
                }
                Some(Signal::Complete) | None => break Err(WorkflowError::Aborted(key.clone())),
            }
        };

        subscription.unsubscribe();
        if let Err(err) = actor.stop() {
            tracing::debug!(branch = %key, error = %err, "branch actor already detached");
        }
        match &outcome {
            Ok(snapshot) => tracing::debug!(run_id = %run.run_id, branch = %key, value = %snapshot.value, "branch settled"),
            Err(err) => tracing::error!(run_id = %run.run_id, branch = %key, error = %err, "branch failed"),
        }
        outcome
    }
    .boxed()
}
