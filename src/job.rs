//! Remote compilation jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::channel::{CompileRequest, JobOutcome};

/// State of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Slot reserved, request not yet handed to the channel.
    Queued,
    /// Request sent; waiting for the slave's result.
    Running,
    Completed,
    Failed,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Failed) |
            // A result can overtake the Running transition.
            (Queued, Completed) |
            (Running, Completed) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One compilation unit placed on a slave.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub host: String,
    pub request: CompileRequest,
    pub state: JobState,
    pub outcome: Option<JobOutcome>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(host: impl Into<String>, request: CompileRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            host: host.into(),
            request,
            state: JobState::Queued,
            outcome: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(&mut self, new_state: JobState) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }
        self.state = new_state;
        if new_state.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Move to Completed or Failed according to `outcome`.
    pub fn finish(&mut self, outcome: JobOutcome) -> Result<(), String> {
        let target = if outcome.is_success() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.transition_to(target)?;
        self.outcome = Some(outcome);
        Ok(())
    }
}

/// Terminal notification for a job, published to the build driver.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub host: String,
    pub obj_name: String,
    pub state: JobState,
    pub outcome: JobOutcome,
}

impl JobEvent {
    pub(crate) fn from_job(job: &Job) -> Option<Self> {
        Some(Self {
            job_id: job.id,
            host: job.host.clone(),
            obj_name: job.request.obj_name.clone(),
            state: job.state,
            outcome: job.outcome.clone()?,
        })
    }
}
