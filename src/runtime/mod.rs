//! Actor runtime: mailboxes, actors, Systems, timers, snapshots
//!
//! This module holds everything below the statechart layer. Actors are
//! generic over `ActorLogic`; the statechart interpreter in `machine` and the
//! future-backed logic used by workflows are both plugged in through it.

use std::path::PathBuf;
use serde::{Deserialize, Serialize};

pub mod actor;
pub mod error;
pub mod event;
pub mod inspect;
pub mod logic;
pub mod mailbox;
pub mod scheduler;
pub mod snapshot;
pub mod storage;
pub mod system;

pub use actor::{Actor, ActorLogic, ActorRef, ActorScope, Effect, Observer, Subscription};
pub use event::{Event, SessionId};
pub use snapshot::{PersistedChild, PersistedSnapshot, Snapshot, SnapshotStatus};
pub use system::System;

/// Configuration for the stepchart runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory of the file snapshot store (default: .stepchart/)
    pub root: PathBuf,

    /// Maximum microsteps in one macrostep before the step is aborted
    pub max_microsteps: usize,

    /// Retry delay for steps that do not configure one, in milliseconds
    pub default_retry_delay_ms: u64,

    /// Attach the tracing inspector to every System
    pub inspect: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".stepchart"),
            max_microsteps: 10_000,
            default_retry_delay_ms: 1_000,
            inspect: false,
        }
    }
}

impl RuntimeConfig {
    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> error::Result<()> {
        if self.max_microsteps == 0 {
            return Err(error::RuntimeError::Config("max_microsteps must be at least 1".into()));
        }
        if self.root.as_os_str().is_empty() {
            return Err(error::RuntimeError::Config("root directory must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_fill_missing_fields() {
        let config: RuntimeConfig = serde_json::from_str(r#"{"max_microsteps": 5}"#).unwrap();
        assert_eq!(config.max_microsteps, 5);
        assert_eq!(config.root, PathBuf::from(".stepchart"));
        assert_eq!(config.default_retry_delay_ms, 1_000);
    }

    #[test]
    fn test_validate_rejects_unusable_settings() {
        assert!(RuntimeConfig::default().validate().is_ok());

        let config = RuntimeConfig {
            max_microsteps: 0,
            ..RuntimeConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, error::RuntimeError::Config(detail) if detail.contains("max_microsteps")));

        let config = RuntimeConfig {
            root: PathBuf::new(),
            ..RuntimeConfig::default()
        };
        assert!(matches!(config.validate(), Err(error::RuntimeError::Config(_))));
    }
}
