//! One remote compilation host.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::channel::Channel;
use crate::slave::declare::SlaveDecl;
use crate::slave::state::{StateTransition, WorkerState};

/// A declared slave and its registration state.
///
/// Owned by the registry; the channel is present only while Active (and
/// handed to teardown when Draining).
pub struct Worker {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) slots: usize,
    pub(crate) outstanding: usize,
    pub(crate) state: WorkerState,
    pub(crate) channel: Option<Arc<dyn Channel>>,
    pub(crate) last_error: Option<String>,
    pub(crate) transitions: Vec<StateTransition>,
}

impl Worker {
    pub fn new(decl: SlaveDecl) -> Self {
        Self {
            host: decl.host,
            port: decl.port,
            slots: decl.slots,
            outstanding: 0,
            state: WorkerState::Unregistered,
            channel: None,
            last_error: None,
            transitions: Vec::new(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: WorkerState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition slave {} from {} to {}",
                self.host, self.state, new_state
            ));
        }

        tracing::debug!(
            host = %self.host,
            from = %self.state,
            to = %new_state,
            reason = reason.as_deref().unwrap_or(""),
            "Slave state transition"
        );

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;

        if !new_state.is_active() {
            self.outstanding = 0;
        }
        Ok(())
    }

    /// Slots not currently running a job. Zero unless Active.
    pub fn free_slots(&self) -> usize {
        if self.state.is_active() {
            self.slots.saturating_sub(self.outstanding)
        } else {
            0
        }
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            host: self.host.clone(),
            port: self.port,
            slots: self.slots,
            outstanding: self.outstanding,
            state: self.state,
            last_error: self.last_error.clone(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("slots", &self.slots)
            .field("outstanding", &self.outstanding)
            .field("state", &self.state)
            .field("has_channel", &self.channel.is_some())
            .finish()
    }
}

/// Read-only snapshot of a slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub host: String,
    pub port: u16,
    pub slots: usize,
    pub outstanding: usize,
    pub state: WorkerState,
    pub last_error: Option<String>,
}
