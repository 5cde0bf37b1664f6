//! Inspection sinks
//!
//! A System fans structured lifecycle records out to every registered sink.
//! Sinks are called inline, so they must return quickly and never call back
//! into the engine.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

use super::event::{Event, SessionId};
use super::snapshot::SnapshotStatus;

/// A lifecycle record emitted by the engine
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InspectionEvent {
    /// An actor was registered with its System
    ActorCreated {
        /// Session of the new actor
        session: SessionId,
        /// Id relative to the parent
        id: String,
        /// Logic source key
        src: String,
        /// Session of the parent, if any
        parent: Option<SessionId>,
    },
    /// An event was routed to an actor
    EventRelayed {
        /// Sender session, absent for external sends
        source: Option<SessionId>,
        /// Receiver session
        target: SessionId,
        /// The event
        event: Event,
    },
    /// A statechart applied one transition set
    MicrostepTaken {
        /// Session of the stepping actor
        session: SessionId,
        /// Event that triggered the microstep
        event: Event,
        /// Source ids of the applied transitions
        transitions: Vec<String>,
    },
    /// An actor committed a snapshot
    SnapshotEmitted {
        /// Session of the actor
        session: SessionId,
        /// Snapshot status
        status: SnapshotStatus,
        /// Snapshot state value
        value: Value,
    },
}

/// Receiver of inspection records
pub trait InspectionSink: Send + Sync {
    /// Observe one record
    fn inspect(&self, event: &InspectionEvent);
}

impl<F> InspectionSink for F
where
    F: Fn(&InspectionEvent) + Send + Sync,
{
    fn inspect(&self, event: &InspectionEvent) {
        self(event)
    }
}

/// Writes every record to `tracing` at trace level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInspector;

impl InspectionSink for TracingInspector {
    fn inspect(&self, event: &InspectionEvent) {
        match event {
            InspectionEvent::ActorCreated { session, id, src, .. } => {
                tracing::trace!(%session, id, src, "actor created");
            }
            InspectionEvent::EventRelayed { source, target, event } => {
                tracing::trace!(?source, %target, event = event.event_type(), "event relayed");
            }
            InspectionEvent::MicrostepTaken { session, event, transitions } => {
                tracing::trace!(%session, event = event.event_type(), ?transitions, "microstep");
            }
            InspectionEvent::SnapshotEmitted { session, status, value } => {
                tracing::trace!(%session, ?status, %value, "snapshot emitted");
            }
        }
    }
}

/// Keeps every record in memory
#[derive(Debug, Default)]
pub struct RecordingInspector {
    events: Mutex<Vec<InspectionEvent>>,
}

impl RecordingInspector {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything recorded so far
    pub fn events(&self) -> Vec<InspectionEvent> {
        self.events.lock().clone()
    }
}

impl InspectionSink for RecordingInspector {
    fn inspect(&self, event: &InspectionEvent) {
        self.events.lock().push(event.clone());
    }
}
