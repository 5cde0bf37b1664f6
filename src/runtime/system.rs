//! Per-tree System: registries, relay, and the delayed-event scheduler
//!
//! One System is created by each root actor and shared by its descendants.
//! Its registries and timer table are the only state visible across the
//! tree, and every mutation goes through the locks held here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};

use super::RuntimeConfig;
use super::actor::{ActorCell, ActorRef};
use super::error::{ActorError, ActorResult};
use super::event::{Event, SessionId};
use super::inspect::{InspectionEvent, InspectionSink, TracingInspector};
use super::scheduler::{ScheduledEvent, Scheduler, TimerEntry};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(0);

struct SystemInner {
    config: RuntimeConfig,
    actors: RwLock<HashMap<SessionId, Weak<ActorCell>>>,
    keyed: RwLock<HashMap<String, SessionId>>,
    scheduler: Mutex<Scheduler>,
    inspectors: RwLock<Vec<Arc<dyn InspectionSink>>>,
}

/// Shared services of one actor tree
#[derive(Clone)]
pub struct System {
    inner: Arc<SystemInner>,
}

impl Default for System {
    fn default() -> Self {
        Self::new()
    }
}

impl System {
    /// Create a System with the default configuration
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a System from a runtime configuration
    pub fn with_config(config: RuntimeConfig) -> Self {
        let mut inspectors: Vec<Arc<dyn InspectionSink>> = Vec::new();
        if config.inspect {
            inspectors.push(Arc::new(TracingInspector));
        }
        Self {
            inner: Arc::new(SystemInner {
                config,
                actors: RwLock::new(HashMap::new()),
                keyed: RwLock::new(HashMap::new()),
                scheduler: Mutex::new(Scheduler::new()),
                inspectors: RwLock::new(inspectors),
            }),
        }
    }

    /// Runtime configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Attach an inspection sink
    pub fn add_inspector(&self, sink: Arc<dyn InspectionSink>) {
        self.inner.inspectors.write().push(sink);
    }

    pub(crate) fn next_session(&self) -> SessionId {
        SessionId(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn inspect(&self, event: &InspectionEvent) {
        for sink in self.inner.inspectors.read().iter() {
            sink.inspect(event);
        }
    }

    pub(crate) fn register(&self, actor: &ActorRef) {
        self.inner
            .actors
            .write()
            .insert(actor.session_id(), actor.downgrade());
    }

    pub(crate) fn unregister(&self, actor: &ActorRef) {
        self.inner.actors.write().remove(&actor.session_id());
        if let Some(system_id) = actor.system_id() {
            let mut keyed = self.inner.keyed.write();
            if keyed.get(system_id) == Some(&actor.session_id()) {
                keyed.remove(system_id);
            }
        }
    }

    /// Register a globally addressable id for an actor
    pub fn register_system_id(&self, system_id: &str, actor: &ActorRef) -> ActorResult<()> {
        let mut keyed = self.inner.keyed.write();
        if keyed.contains_key(system_id) {
            return Err(ActorError::DuplicateSystemId(system_id.to_string()));
        }
        keyed.insert(system_id.to_string(), actor.session_id());
        Ok(())
    }

    /// Look up an actor by system id
    pub fn get(&self, system_id: &str) -> Option<ActorRef> {
        let session = *self.inner.keyed.read().get(system_id)?;
        self.actor(session)
    }

    /// Look up a live actor by session id
    pub fn actor(&self, session: SessionId) -> Option<ActorRef> {
        let cell = self.inner.actors.read().get(&session)?.upgrade()?;
        Some(ActorRef::from_cell(cell))
    }

    /// Look up a live actor by its path
    pub fn actor_by_path(&self, path: &str) -> Option<ActorRef> {
        self.inner
            .actors
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(ActorRef::from_cell)
            .find(|actor| actor.path() == path)
    }

    /// Number of live registered actors
    pub fn len(&self) -> usize {
        self.inner.actors.read().len()
    }

    /// Whether no actors are registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Route an event to `target`, making the hop visible to inspectors
    pub fn relay(&self, source: Option<SessionId>, target: &ActorRef, event: Event) {
        self.inspect(&InspectionEvent::EventRelayed {
            source,
            target: target.session_id(),
            event: event.clone(),
        });
        target.deliver(event);
    }

    /// Arm a delayed event from `source` to `target`
    pub fn schedule(&self, source: &ActorRef, target: &ActorRef, event: Event, delay: Duration, id: String) {
        let descriptor = ScheduledEvent {
            id,
            source: source.path().to_string(),
            target: target.path().to_string(),
            event,
            delay_ms: delay.as_millis() as u64,
            started_at: Utc::now(),
        };
        self.arm(source.session_id(), target.session_id(), descriptor, delay);
    }

    /// Cancel a delayed event; returns whether it was still pending
    pub fn cancel(&self, source: SessionId, id: &str) -> bool {
        self.inner.scheduler.lock().cancel(source, id)
    }

    /// Cancel every delayed event armed by `source`
    pub fn cancel_all(&self, source: SessionId) -> usize {
        self.inner.scheduler.lock().cancel_all(source)
    }

    /// Descriptors of every pending delayed event
    pub fn scheduled_events(&self) -> Vec<ScheduledEvent> {
        self.inner.scheduler.lock().descriptors()
    }

    /// Re-arm persisted timers with their elapsed time deducted
    pub fn reschedule(&self, events: &[ScheduledEvent]) {
        let now = Utc::now();
        for descriptor in events {
            let source = self.actor_by_path(&descriptor.source);
            let target = self.actor_by_path(&descriptor.target);
            match (source, target) {
                (Some(source), Some(target)) => {
                    let delay = descriptor.remaining(now);
                    self.arm(source.session_id(), target.session_id(), descriptor.clone(), delay);
                }
                _ => tracing::warn!(
                    id = %descriptor.id,
                    source = %descriptor.source,
                    target = %descriptor.target,
                    "cannot reschedule timer; actor not found"
                ),
            }
        }
    }

    fn arm(&self, source: SessionId, target: SessionId, descriptor: ScheduledEvent, delay: Duration) {
        // The table lock is held while spawning so a zero delay cannot fire before insertion.
        let mut scheduler = self.inner.scheduler.lock();
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let system = self.clone();
                let id = descriptor.id.clone();
                let task = runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    system.fire(source, &id);
                });
                Some(task.abort_handle())
            }
            Err(_) => {
                tracing::warn!(id = %descriptor.id, "no async runtime; timer kept for rescheduling only");
                None
            }
        };
        scheduler.insert(
            source,
            TimerEntry {
                descriptor,
                target,
                handle,
            },
        );
    }

    fn fire(&self, source: SessionId, id: &str) {
        let entry = self.inner.scheduler.lock().take(source, id);
        let Some(entry) = entry else {
            return;
        };
        match self.actor(entry.target) {
            Some(target) => self.relay(Some(source), &target, entry.descriptor.event),
            None => tracing::warn!(id, target = %entry.descriptor.target, "timer target is gone"),
        }
    }
}
