//! Delayed-event timer table
//!
//! Each System owns one table keyed by `(source session, delay id)`. Entries
//! pair a tokio abort handle with a serializable descriptor so pending timers
//! can be written out with a root snapshot and rescheduled after a restart.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use super::event::{Event, SessionId};

/// Serializable description of a pending delayed event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledEvent {
    /// Delay id, unique per source actor
    pub id: String,
    /// Path of the scheduling actor
    pub source: String,
    /// Path of the receiving actor
    pub target: String,
    /// Event to deliver
    pub event: Event,
    /// Requested delay in milliseconds
    pub delay_ms: u64,
    /// Wall-clock time the timer was armed
    pub started_at: DateTime<Utc>,
}

impl ScheduledEvent {
    /// Time left before the event is due, zero if already overdue
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        let elapsed = now
            .signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        Duration::from_millis(self.delay_ms.saturating_sub(elapsed))
    }
}

/// A pending timer
#[derive(Debug)]
pub struct TimerEntry {
    /// Persistable descriptor
    pub descriptor: ScheduledEvent,
    /// Session that receives the event
    pub target: SessionId,
    /// Handle of the sleeping task, absent when no async runtime was available
    pub handle: Option<AbortHandle>,
}

impl TimerEntry {
    fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

/// Timer table scoped to a single System
#[derive(Debug, Default)]
pub struct Scheduler {
    timers: HashMap<(SessionId, String), TimerEntry>,
}

impl Scheduler {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a timer, cancelling any previous timer with the same key
    pub fn insert(&mut self, source: SessionId, entry: TimerEntry) {
        let key = (source, entry.descriptor.id.clone());
        if let Some(previous) = self.timers.insert(key, entry) {
            previous.abort();
        }
    }

    /// Remove a timer so it can fire; `None` means it was cancelled
    pub fn take(&mut self, source: SessionId, id: &str) -> Option<TimerEntry> {
        self.timers.remove(&(source, id.to_string()))
    }

    /// Cancel one timer
    pub fn cancel(&mut self, source: SessionId, id: &str) -> bool {
        match self.take(source, id) {
            Some(entry) => {
                entry.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every timer armed by `source`
    pub fn cancel_all(&mut self, source: SessionId) -> usize {
        let keys: Vec<_> = self
            .timers
            .keys()
            .filter(|(session, _)| *session == source)
            .cloned()
            .collect();
        for key in &keys {
            if let Some(entry) = self.timers.remove(key) {
                entry.abort();
            }
        }
        keys.len()
    }

    /// Descriptors of all pending timers, oldest first
    pub fn descriptors(&self) -> Vec<ScheduledEvent> {
        let mut descriptors: Vec<_> = self
            .timers
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        descriptors
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    /// Whether no timers are pending
    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, delay_ms: u64) -> TimerEntry {
        TimerEntry {
            descriptor: ScheduledEvent {
                id: id.to_string(),
                source: "root".into(),
                target: "root".into(),
                event: Event::new("TICK"),
                delay_ms,
                started_at: Utc::now(),
            },
            target: SessionId(1),
            handle: None,
        }
    }

    #[test]
    fn test_cancel_all_is_scoped_to_source() {
        let mut scheduler = Scheduler::new();
        scheduler.insert(SessionId(1), entry("a", 10));
        scheduler.insert(SessionId(1), entry("b", 10));
        scheduler.insert(SessionId(2), entry("a", 10));

        assert_eq!(scheduler.cancel_all(SessionId(1)), 2);
        assert_eq!(scheduler.len(), 1);
        assert!(scheduler.take(SessionId(2), "a").is_some());
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_same_key_replaces_timer() {
        let mut scheduler = Scheduler::new();
        scheduler.insert(SessionId(1), entry("a", 10));
        scheduler.insert(SessionId(1), entry("a", 20));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.descriptors()[0].delay_ms, 20);
        assert!(!scheduler.cancel(SessionId(9), "a"));
    }

    #[test]
    fn test_remaining_accounts_for_elapsed_time() {
        let mut descriptor = entry("a", 1_000).descriptor;
        descriptor.started_at = Utc::now() - chrono::Duration::milliseconds(400);
        let remaining = descriptor.remaining(Utc::now());
        assert!(remaining <= Duration::from_millis(600));
        assert!(remaining >= Duration::from_millis(500));

        descriptor.started_at = Utc::now() - chrono::Duration::seconds(5);
        assert_eq!(descriptor.remaining(Utc::now()), Duration::ZERO);
    }
}
