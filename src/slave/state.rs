//! Slave connection state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Declared, not connected (or connection lost).
    Unregistered,
    /// Connect, handshake and source sync in progress.
    Registering,
    /// Accepting jobs.
    Active,
    /// Told to disconnect, not yet released.
    Draining,
    /// Released for the rest of the session.
    Closed,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            // Registration
            (Unregistered, Registering) |
            (Registering, Active) | (Registering, Unregistered) |
            // Connection loss
            (Active, Unregistered) |
            // Teardown
            (Active, Draining) | (Draining, Closed) |
            (Unregistered, Closed) | (Registering, Closed)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unregistered => "unregistered",
            Self::Registering => "registering",
            Self::Active => "active",
            Self::Draining => "draining",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: WorkerState,
    pub to: WorkerState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}
