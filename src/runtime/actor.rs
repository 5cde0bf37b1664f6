//! Actors, actor logic, and the per-step effect scope
//!
//! An actor owns a mailbox, a logic definition and its current snapshot.
//! Events are processed one at a time: the logic computes the next snapshot
//! into an `ActorScope`, the snapshot is committed, and only then are the
//! deferred effects collected in the scope flushed.
//!
//! Parent links are session ids resolved through the System registry; the
//! only owning references are the child refs inside a parent's snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;

use super::error::{ActorError, ActorResult};
use super::event::{Event, SessionId};
use super::inspect::InspectionEvent;
use super::mailbox::Mailbox;
use super::snapshot::{PersistedChild, PersistedSnapshot, Snapshot, SnapshotStatus};
use super::system::System;

/// Behavior of an actor
///
/// Implementations must be pure with respect to the snapshot: every side
/// effect goes through the `ActorScope` so it runs after the commit.
pub trait ActorLogic: Send + Sync + 'static {
    /// Compute the first snapshot from the actor input
    fn initial_snapshot(&self, scope: &mut ActorScope<'_>, input: Value) -> ActorResult<Snapshot>;

    /// Compute the snapshot that follows `event`
    fn transition(
        &self,
        snapshot: &Snapshot,
        event: &Event,
        scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot>;

    /// Startup side effects, run once after the first snapshot exists
    fn start(&self, _snapshot: &Snapshot, _scope: &mut ActorScope<'_>) {}

    /// Build the persisted form from already-persisted children
    fn persisted_snapshot(
        &self,
        snapshot: &Snapshot,
        children: BTreeMap<String, PersistedChild>,
    ) -> PersistedSnapshot {
        snapshot.to_persisted(children)
    }

    /// Revive a persisted snapshot, recreating children through the scope
    fn restore_snapshot(
        &self,
        persisted: &PersistedSnapshot,
        scope: &mut ActorScope<'_>,
    ) -> ActorResult<Snapshot> {
        if !persisted.children.is_empty() {
            return Err(ActorError::Restore {
                id: scope.self_ref().id().to_string(),
                detail: "logic does not own children".into(),
            });
        }
        Ok(Snapshot::from(persisted))
    }
}

/// Receiver of committed snapshots and lifecycle notifications
pub trait Observer: Send + Sync {
    /// A snapshot was committed
    fn next(&self, snapshot: &Snapshot);

    /// The actor failed
    fn error(&self, _error: &ActorError) {}

    /// The actor reached `done` or was stopped
    fn complete(&self) {}
}

impl<F> Observer for F
where
    F: Fn(&Snapshot) + Send + Sync,
{
    fn next(&self, snapshot: &Snapshot) {
        self(snapshot)
    }
}

/// Side effect deferred until the snapshot that produced it is committed
pub enum Effect {
    /// Deliver an event now
    Send {
        /// Receiver
        target: ActorRef,
        /// Event
        event: Event,
    },
    /// Deliver an event after a delay, cancellable by id
    SendAfter {
        /// Receiver
        target: ActorRef,
        /// Event
        event: Event,
        /// Delay
        delay: Duration,
        /// Delay id, unique per sending actor
        id: String,
    },
    /// Cancel a delayed send of this actor
    Cancel {
        /// Delay id
        id: String,
    },
    /// Start a child created during the step
    Start(ActorRef),
    /// Stop a child
    Stop(ActorRef),
    /// Run a closure
    Run(Box<dyn FnOnce() + Send>),
    /// Spawn a background task owned by this actor
    Task(BoxFuture<'static, ()>),
}

/// Per-step buffer handed to actor logic
pub struct ActorScope<'a> {
    actor: &'a ActorRef,
    effects: Vec<Effect>,
}

impl<'a> ActorScope<'a> {
    pub(crate) fn new(actor: &'a ActorRef) -> Self {
        Self {
            actor,
            effects: Vec::new(),
        }
    }

    /// The stepping actor
    pub fn self_ref(&self) -> &ActorRef {
        self.actor
    }

    /// The stepping actor's System
    pub fn system(&self) -> &System {
        &self.actor.cell.system
    }

    /// Queue an effect
    pub fn defer(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    /// Queue an event for another actor
    pub fn send(&mut self, target: &ActorRef, event: Event) {
        self.defer(Effect::Send {
            target: target.clone(),
            event,
        });
    }

    /// Queue a delayed event
    pub fn send_after(&mut self, target: &ActorRef, event: Event, delay: Duration, id: String) {
        self.defer(Effect::SendAfter {
            target: target.clone(),
            event,
            delay,
            id,
        });
    }

    /// Queue cancellation of a delayed event
    pub fn cancel(&mut self, id: impl Into<String>) {
        self.defer(Effect::Cancel { id: id.into() });
    }

    /// Queue a background task
    pub fn spawn_task(&mut self, task: BoxFuture<'static, ()>) {
        self.defer(Effect::Task(task));
    }

    /// Create a child actor; it starts after the current step commits
    pub fn spawn_child(
        &mut self,
        id: &str,
        src: &str,
        logic: Arc<dyn ActorLogic>,
        input: Value,
        system_id: Option<String>,
    ) -> ActorRef {
        let child = ActorRef::create(
            self.system().clone(),
            id,
            src,
            Some(self.actor),
            logic,
            Seed::Input(input),
            system_id,
        );
        self.defer(Effect::Start(child.clone()));
        child
    }

    /// Recreate a child from its persisted snapshot
    pub fn restore_child(
        &mut self,
        id: &str,
        src: &str,
        logic: Arc<dyn ActorLogic>,
        persisted: PersistedSnapshot,
    ) -> ActorRef {
        let child = ActorRef::create(
            self.system().clone(),
            id,
            src,
            Some(self.actor),
            logic,
            Seed::Restored(persisted),
            None,
        );
        self.defer(Effect::Start(child.clone()));
        child
    }

    /// Queue a stop for a child
    pub fn stop_child(&mut self, child: &ActorRef) {
        self.defer(Effect::Stop(child.clone()));
    }

    /// Emit an inspection record immediately
    pub fn inspect(&self, event: InspectionEvent) {
        self.system().inspect(&event);
    }

    fn into_effects(self) -> Vec<Effect> {
        self.effects
    }
}

/// Constructors for root actors
pub struct Actor;

impl Actor {
    /// Create a root actor with its own System
    pub fn root(logic: Arc<dyn ActorLogic>, input: Value) -> ActorRef {
        Self::root_in(&System::new(), "root", logic, input)
    }

    /// Create a root actor in a prepared System
    pub fn root_in(system: &System, id: &str, logic: Arc<dyn ActorLogic>, input: Value) -> ActorRef {
        ActorRef::create(system.clone(), id, id, None, logic, Seed::Input(input), None)
    }

    /// Create a root actor that resumes from a persisted snapshot
    pub fn restore(logic: Arc<dyn ActorLogic>, persisted: PersistedSnapshot) -> ActorRef {
        Self::restore_in(&System::new(), "root", logic, persisted)
    }

    /// Restore a root actor in a prepared System
    pub fn restore_in(
        system: &System,
        id: &str,
        logic: Arc<dyn ActorLogic>,
        persisted: PersistedSnapshot,
    ) -> ActorRef {
        ActorRef::create(system.clone(), id, id, None, logic, Seed::Restored(persisted), None)
    }
}

enum Seed {
    Input(Value),
    Restored(PersistedSnapshot),
    Consumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessStatus {
    NotStarted,
    Running,
    Stopped,
}

struct CellState {
    status: ProcessStatus,
    snapshot: Option<Snapshot>,
    seed: Seed,
    error: Option<ActorError>,
    observers: Vec<(u64, Arc<dyn Observer>)>,
    next_observer: u64,
    tasks: Vec<AbortHandle>,
}

pub(crate) struct ActorCell {
    session: SessionId,
    id: String,
    src: String,
    path: String,
    parent: Option<SessionId>,
    system_id: Option<String>,
    system: System,
    logic: Arc<dyn ActorLogic>,
    mailbox: Mailbox<Event>,
    state: Mutex<CellState>,
}

/// Cheap handle to an actor
#[derive(Clone)]
pub struct ActorRef {
    cell: Arc<ActorCell>,
}

impl ActorRef {
    fn create(
        system: System,
        id: &str,
        src: &str,
        parent: Option<&ActorRef>,
        logic: Arc<dyn ActorLogic>,
        seed: Seed,
        system_id: Option<String>,
    ) -> ActorRef {
        let session = system.next_session();
        let path = match parent {
            Some(parent) => format!("{}/{}", parent.path(), id),
            None => id.to_string(),
        };
        let cell = Arc::new_cyclic(|weak: &Weak<ActorCell>| {
            let weak = weak.clone();
            ActorCell {
                session,
                id: id.to_string(),
                src: src.to_string(),
                path,
                parent: parent.map(ActorRef::session_id),
                system_id,
                system,
                logic,
                mailbox: Mailbox::new(Box::new(move |event: Event| {
                    if let Some(cell) = weak.upgrade() {
                        ActorRef { cell }.process(event);
                    }
                })),
                state: Mutex::new(CellState {
                    status: ProcessStatus::NotStarted,
                    snapshot: None,
                    seed,
                    error: None,
                    observers: Vec::new(),
                    next_observer: 0,
                    tasks: Vec::new(),
                }),
            }
        });
        ActorRef { cell }
    }

    pub(crate) fn from_cell(cell: Arc<ActorCell>) -> Self {
        Self { cell }
    }

    pub(crate) fn downgrade(&self) -> Weak<ActorCell> {
        Arc::downgrade(&self.cell)
    }

    /// Process-unique session id
    pub fn session_id(&self) -> SessionId {
        self.cell.session
    }

    /// Id relative to the parent
    pub fn id(&self) -> &str {
        &self.cell.id
    }

    /// Logic source key used to recreate this actor
    pub fn src(&self) -> &str {
        &self.cell.src
    }

    /// Slash-separated ids from the root to this actor
    pub fn path(&self) -> &str {
        &self.cell.path
    }

    /// Globally addressable id, if registered with one
    pub fn system_id(&self) -> Option<&str> {
        self.cell.system_id.as_deref()
    }

    /// Owning System
    pub fn system(&self) -> &System {
        &self.cell.system
    }

    /// Parent actor, resolved through the System registry
    pub fn parent(&self) -> Option<ActorRef> {
        self.cell.parent.and_then(|session| self.cell.system.actor(session))
    }

    /// Whether the actor has stopped processing
    pub fn is_stopped(&self) -> bool {
        self.cell.state.lock().status == ProcessStatus::Stopped
    }

    /// Latest committed snapshot; an empty active snapshot before start
    pub fn snapshot(&self) -> Snapshot {
        self.cell
            .state
            .lock()
            .snapshot
            .clone()
            .unwrap_or_else(|| Snapshot::new(Value::Null))
    }

    /// Start the actor; calling it again does nothing
    pub fn start(&self) {
        let seed = {
            let mut state = self.cell.state.lock();
            if state.status != ProcessStatus::NotStarted {
                return;
            }
            state.status = ProcessStatus::Running;
            std::mem::replace(&mut state.seed, Seed::Consumed)
        };

        let system = self.cell.system.clone();
        system.register(self);
        system.inspect(&InspectionEvent::ActorCreated {
            session: self.cell.session,
            id: self.cell.id.clone(),
            src: self.cell.src.clone(),
            parent: self.cell.parent,
        });
        if let Some(system_id) = &self.cell.system_id {
            if let Err(err) = system.register_system_id(system_id, self) {
                self.fail(Snapshot::new(Value::Null), err);
                return;
            }
        }

        let mut scope = ActorScope::new(self);
        let (result, scheduled, restored) = match seed {
            Seed::Input(input) => (self.cell.logic.initial_snapshot(&mut scope, input), Vec::new(), false),
            Seed::Restored(persisted) => {
                let scheduled = persisted.scheduled.clone();
                (self.cell.logic.restore_snapshot(&persisted, &mut scope), scheduled, true)
            }
            Seed::Consumed => return,
        };

        match result {
            Ok(snapshot) => {
                self.cell.logic.start(&snapshot, &mut scope);
                tracing::debug!(session = %self.cell.session, path = %self.cell.path, restored, "actor started");
                self.commit(snapshot, scope.into_effects(), !restored);
                if self.cell.parent.is_none() && !scheduled.is_empty() {
                    system.reschedule(&scheduled);
                }
                if !self.is_stopped() {
                    self.cell.mailbox.start();
                }
            }
            Err(err) => self.fail(Snapshot::new(Value::Null), err),
        }
    }

    /// Send an event from outside the actor tree
    pub fn send(&self, event: Event) {
        self.cell.system.relay(None, self, event);
    }

    /// Stop a root actor; children are stopped through their parent
    pub fn stop(&self) -> ActorResult<()> {
        if self.cell.parent.is_some() {
            return Err(ActorError::NotRoot(self.cell.path.clone()));
        }
        self.enqueue_stop();
        Ok(())
    }

    /// Observe committed snapshots
    pub fn subscribe(&self, observer: impl Observer + 'static) -> Subscription {
        let observer: Arc<dyn Observer> = Arc::new(observer);
        let late = {
            let mut state = self.cell.state.lock();
            let terminal = state
                .snapshot
                .as_ref()
                .map(|snapshot| snapshot.status)
                .filter(|status| status.is_terminal() && state.status == ProcessStatus::Stopped);
            match terminal {
                Some(status) => Some((status, state.error.clone())),
                None => {
                    let id = state.next_observer;
                    state.next_observer += 1;
                    state.observers.push((id, observer.clone()));
                    return Subscription {
                        cell: self.downgrade(),
                        id,
                    };
                }
            }
        };

        if let Some((status, error)) = late {
            match (status, error) {
                (SnapshotStatus::Error, Some(error)) => observer.error(&error),
                _ => observer.complete(),
            }
        }
        Subscription {
            cell: Weak::new(),
            id: 0,
        }
    }

    /// Persisted snapshot of this actor and all its descendants
    pub fn persisted_snapshot(&self) -> PersistedSnapshot {
        let (snapshot, seed) = {
            let state = self.cell.state.lock();
            let seed = match &state.seed {
                Seed::Restored(persisted) => Some(persisted.clone()),
                _ => None,
            };
            (state.snapshot.clone(), seed)
        };
        let Some(snapshot) = snapshot else {
            return seed.unwrap_or_else(|| Snapshot::new(Value::Null).to_persisted(BTreeMap::new()));
        };

        let children = snapshot
            .children
            .iter()
            .map(|(id, child)| {
                let persisted = PersistedChild {
                    src: child.src().to_string(),
                    snapshot: child.persisted_snapshot(),
                };
                (id.clone(), persisted)
            })
            .collect();
        let mut persisted = self.cell.logic.persisted_snapshot(&snapshot, children);
        if self.cell.parent.is_none() {
            persisted.scheduled = self.cell.system.scheduled_events();
        }
        persisted
    }

    pub(crate) fn deliver(&self, event: Event) {
        if self.is_stopped() {
            tracing::trace!(path = %self.cell.path, event = event.event_type(), "dropped event for stopped actor");
            return;
        }
        self.cell.mailbox.enqueue(event);
    }

    fn enqueue_stop(&self) {
        {
            let mut state = self.cell.state.lock();
            match state.status {
                ProcessStatus::Stopped => return,
                ProcessStatus::NotStarted => {
                    state.status = ProcessStatus::Stopped;
                    return;
                }
                ProcessStatus::Running => {}
            }
        }
        self.cell.mailbox.clear();
        self.cell.mailbox.enqueue(Event::stop());
    }

    fn process(&self, event: Event) {
        let current = {
            let state = self.cell.state.lock();
            if state.status != ProcessStatus::Running {
                return;
            }
            match &state.snapshot {
                Some(snapshot) => snapshot.clone(),
                None => return,
            }
        };

        let mut scope = ActorScope::new(self);
        match self.cell.logic.transition(&current, &event, &mut scope) {
            Ok(mut next) => {
                if event.is_stop() && next.status == SnapshotStatus::Active {
                    next.status = SnapshotStatus::Stopped;
                }
                self.commit(next, scope.into_effects(), true);
            }
            Err(err) => self.fail(current, err),
        }
    }

    fn commit(&self, snapshot: Snapshot, effects: Vec<Effect>, report: bool) {
        let observers = {
            let mut state = self.cell.state.lock();
            state.snapshot = Some(snapshot.clone());
            state.observers.iter().map(|(_, observer)| observer.clone()).collect::<Vec<_>>()
        };
        self.cell.system.inspect(&InspectionEvent::SnapshotEmitted {
            session: self.cell.session,
            status: snapshot.status,
            value: snapshot.value.clone(),
        });

        self.run_effects(effects);
        for observer in &observers {
            observer.next(&snapshot);
        }

        match snapshot.status {
            SnapshotStatus::Active => {}
            SnapshotStatus::Done => {
                self.shutdown(&snapshot);
                observers.iter().for_each(|observer| observer.complete());
                if report {
                    self.report_to_parent(Event::done_actor(&self.cell.id, snapshot.output.clone()));
                }
            }
            SnapshotStatus::Stopped => {
                self.shutdown(&snapshot);
                observers.iter().for_each(|observer| observer.complete());
            }
            SnapshotStatus::Error => {
                let detail = snapshot.error.clone().unwrap_or_default();
                let error = ActorError::Logic(detail.clone());
                self.cell.state.lock().error = Some(error.clone());
                self.shutdown(&snapshot);
                self.notify_error(&observers, &error, detail);
            }
        }
    }

    fn fail(&self, previous: Snapshot, error: ActorError) {
        let mut snapshot = previous;
        snapshot.status = SnapshotStatus::Error;
        snapshot.error = Some(error.to_string());

        let observers = {
            let mut state = self.cell.state.lock();
            state.snapshot = Some(snapshot.clone());
            state.error = Some(error.clone());
            state.observers.iter().map(|(_, observer)| observer.clone()).collect::<Vec<_>>()
        };
        self.cell.system.inspect(&InspectionEvent::SnapshotEmitted {
            session: self.cell.session,
            status: snapshot.status,
            value: snapshot.value.clone(),
        });
        self.shutdown(&snapshot);
        self.notify_error(&observers, &error, error.to_string());
    }

    fn notify_error(&self, observers: &[Arc<dyn Observer>], error: &ActorError, detail: String) {
        if observers.is_empty() && self.cell.parent.is_none() {
            tracing::error!(path = %self.cell.path, %error, "unobserved actor error");
        }
        observers.iter().for_each(|observer| observer.error(error));
        self.report_to_parent(Event::error_actor(&self.cell.id, detail));
    }

    fn report_to_parent(&self, event: Event) {
        if let Some(parent) = self.parent() {
            self.cell.system.relay(Some(self.cell.session), &parent, event);
        }
    }

    fn shutdown(&self, snapshot: &Snapshot) {
        let tasks = {
            let mut state = self.cell.state.lock();
            state.status = ProcessStatus::Stopped;
            std::mem::take(&mut state.tasks)
        };
        tasks.iter().for_each(AbortHandle::abort);
        self.cell.mailbox.clear();
        self.cell.system.cancel_all(self.cell.session);
        for child in snapshot.children.values() {
            child.enqueue_stop();
        }
        self.cell.system.unregister(self);
        tracing::debug!(session = %self.cell.session, path = %self.cell.path, status = ?snapshot.status, "actor stopped");
    }

    fn run_effects(&self, effects: Vec<Effect>) {
        let system = &self.cell.system;
        for effect in effects {
            match effect {
                Effect::Send { target, event } => system.relay(Some(self.cell.session), &target, event),
                Effect::SendAfter { target, event, delay, id } => {
                    system.schedule(self, &target, event, delay, id)
                }
                Effect::Cancel { id } => {
                    system.cancel(self.cell.session, &id);
                }
                Effect::Start(child) => child.start(),
                Effect::Stop(child) => child.enqueue_stop(),
                Effect::Run(run) => run(),
                Effect::Task(task) => self.spawn_task(task),
            }
        }
    }

    fn spawn_task(&self, task: BoxFuture<'static, ()>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(task).abort_handle();
                let mut state = self.cell.state.lock();
                if state.status == ProcessStatus::Stopped {
                    handle.abort();
                } else {
                    state.tasks.push(handle);
                }
            }
            Err(_) => {
                tracing::warn!(path = %self.cell.path, "no async runtime; background task dropped");
            }
        }
    }
}

impl PartialEq for ActorRef {
    fn eq(&self, other: &Self) -> bool {
        self.cell.session == other.cell.session
    }
}

impl Eq for ActorRef {}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorRef({} {})", self.cell.session, self.cell.path)
    }
}

/// Handle returned by `subscribe`
pub struct Subscription {
    cell: Weak<ActorCell>,
    id: u64,
}

impl Subscription {
    /// Stop receiving notifications
    pub fn unsubscribe(self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.state.lock().observers.retain(|(id, _)| *id != self.id);
        }
    }
}
