//! Persisted run state and snapshot stores
//!
//! A run is stored as one record: the root branch snapshot, the snapshots of
//! every subscriber branch, and which branch owns each suspended step. Saves
//! merge into the existing record so branches finishing in any order never
//! drop each other's state.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::step::StepResult;
use crate::runtime::RuntimeConfig;
use crate::runtime::error::{PersistenceError, PersistenceResult};
use crate::runtime::snapshot::PersistedSnapshot;
use crate::runtime::storage::Storage;

/// Everything needed to resume a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunState {
    /// Snapshot of the top-level branch
    #[serde(default)]
    pub root_snapshot: Option<PersistedSnapshot>,
    /// Snapshots of subscriber branches keyed by dependency key
    #[serde(default)]
    pub child_states: BTreeMap<String, PersistedSnapshot>,
    /// Suspended step id to the branch that holds it
    #[serde(default)]
    pub suspended_steps: BTreeMap<String, String>,
    /// Latest result of every step, as recorded by the run ledger
    #[serde(default)]
    pub step_results: BTreeMap<String, StepResult>,
    /// Data the run was started with
    #[serde(default)]
    pub trigger_data: Value,
    /// Last save
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRunState {
    /// Empty record for a new run
    pub fn new(trigger_data: Value) -> Self {
        Self {
            root_snapshot: None,
            child_states: BTreeMap::new(),
            suspended_steps: BTreeMap::new(),
            step_results: BTreeMap::new(),
            trigger_data,
            updated_at: Utc::now(),
        }
    }

    /// Fold a newer partial record into this one
    ///
    /// Branch snapshots present in `update` replace their counterparts;
    /// branches it does not mention are kept. Step results in `update` are
    /// newer than the stored ones. The suspended set is taken from `update`
    /// since resumes remove entries.
    pub fn merge(&mut self, update: WorkflowRunState) {
        if update.root_snapshot.is_some() {
            self.root_snapshot = update.root_snapshot;
        }
        self.child_states.extend(update.child_states);
        self.step_results.extend(update.step_results);
        self.suspended_steps = update.suspended_steps;
        if !update.trigger_data.is_null() {
            self.trigger_data = update.trigger_data;
        }
        self.updated_at = update.updated_at;
    }

    /// Snapshot of one branch
    pub fn branch(&self, key: &str) -> Option<&PersistedSnapshot> {
        if key == super::graph::ROOT_BRANCH {
            self.root_snapshot.as_ref()
        } else {
            self.child_states.get(key)
        }
    }

    /// Latest result of every step
    ///
    /// Ledger entries are authoritative. Branch contexts only fill in steps
    /// the ledger never saw, as in records written before it was stored.
    pub fn results(&self) -> BTreeMap<String, StepResult> {
        let mut results = self.step_results.clone();
        for snapshot in self.root_snapshot.iter().chain(self.child_states.values()) {
            let Some(steps) = snapshot.context.get("steps").and_then(Value::as_object) else {
                continue;
            };
            for (id, result) in steps {
                if results.contains_key(id) {
                    continue;
                }
                match serde_json::from_value::<StepResult>(result.clone()) {
                    Ok(result) => {
                        results.insert(id.clone(), result);
                    }
                    Err(err) => tracing::warn!(step = %id, error = %err, "ignoring unreadable step result"),
                }
            }
        }
        results
    }
}

/// Persistence boundary for run state
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load a run record
    async fn load(&self, workflow: &str, run_id: &str) -> PersistenceResult<Option<WorkflowRunState>>;

    /// Replace a run record
    async fn save(&self, workflow: &str, run_id: &str, state: &WorkflowRunState) -> PersistenceResult<()>;

    /// Run ids stored for a workflow, sorted
    async fn list_runs(&self, workflow: &str) -> PersistenceResult<Vec<String>>;
}

/// In-memory store for tests and ephemeral runs
#[derive(Default)]
pub struct MemorySnapshotStore {
    records: RwLock<HashMap<(String, String), WorkflowRunState>>,
}

impl MemorySnapshotStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored runs
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn load(&self, workflow: &str, run_id: &str) -> PersistenceResult<Option<WorkflowRunState>> {
        Ok(self
            .records
            .read()
            .get(&(workflow.to_string(), run_id.to_string()))
            .cloned())
    }

    async fn save(&self, workflow: &str, run_id: &str, state: &WorkflowRunState) -> PersistenceResult<()> {
        self.records
            .write()
            .insert((workflow.to_string(), run_id.to_string()), state.clone());
        Ok(())
    }

    async fn list_runs(&self, workflow: &str) -> PersistenceResult<Vec<String>> {
        let mut runs: Vec<String> = self
            .records
            .read()
            .keys()
            .filter(|(name, _)| name == workflow)
            .map(|(_, run_id)| run_id.clone())
            .collect();
        runs.sort();
        Ok(runs)
    }
}

#[derive(Serialize, Deserialize)]
struct Record {
    checksum: String,
    state: WorkflowRunState,
}

fn checksum(state: &WorkflowRunState) -> PersistenceResult<String> {
    let bytes = serde_json::to_vec(state)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// One checksummed JSON file per run under `<root>/runs/<workflow>/`
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    storage: Storage,
}

impl FileSnapshotStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: Storage::new(root.into()),
        }
    }

    /// Store rooted at the configured directory
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.root.clone())
    }

    fn load_blocking(storage: &Storage, workflow: &str, run_id: &str) -> PersistenceResult<Option<WorkflowRunState>> {
        let path = storage.run_path(workflow, run_id);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        let record: Record = serde_json::from_slice(&bytes)?;
        let actual = checksum(&record.state)?;
        if actual != record.checksum {
            return Err(PersistenceError::Corrupted {
                path,
                detail: format!("checksum {} does not match stored {}", actual, record.checksum),
            });
        }
        Ok(Some(record.state))
    }

    fn save_blocking(storage: &Storage, workflow: &str, run_id: &str, state: WorkflowRunState) -> PersistenceResult<()> {
        let record = Record {
            checksum: checksum(&state)?,
            state,
        };
        let data = serde_json::to_vec_pretty(&record)?;
        let backend = |err: anyhow::Error| PersistenceError::Backend(format!("{err:#}"));
        storage.create_dir_all(&storage.workflow_dir(workflow)).map_err(backend)?;
        storage
            .write_atomic(&storage.run_path(workflow, run_id), &data)
            .map_err(backend)
    }
}

async fn blocking<T, F>(work: F) -> PersistenceResult<T>
where
    F: FnOnce() -> PersistenceResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| PersistenceError::Backend(format!("store task failed: {err}")))?
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn load(&self, workflow: &str, run_id: &str) -> PersistenceResult<Option<WorkflowRunState>> {
        let storage = self.storage.clone();
        let (workflow, run_id) = (workflow.to_string(), run_id.to_string());
        blocking(move || Self::load_blocking(&storage, &workflow, &run_id)).await
    }

    async fn save(&self, workflow: &str, run_id: &str, state: &WorkflowRunState) -> PersistenceResult<()> {
        let storage = self.storage.clone();
        let (workflow, run_id, state) = (workflow.to_string(), run_id.to_string(), state.clone());
        blocking(move || Self::save_blocking(&storage, &workflow, &run_id, state)).await
    }

    async fn list_runs(&self, workflow: &str) -> PersistenceResult<Vec<String>> {
        let storage = self.storage.clone();
        let workflow = workflow.to_string();
        blocking(move || {
            storage
                .list_runs(&workflow)
                .map_err(|err| PersistenceError::Backend(format!("{err:#}")))
        })
        .await
    }
}
