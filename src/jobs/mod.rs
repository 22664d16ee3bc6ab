//! Background jobs.
//!
//! A job is one detached agent run. [`JobManager`] creates and tracks jobs,
//! [`JobExecutor`] drives a single job to its terminal state, and
//! [`EventBuffer`] keeps each job's event log so stream clients can
//! reconnect and replay.

mod buffer;
mod executor;
mod manager;
mod stream;

pub use buffer::{BufferedEvent, EventBuffer, Listener, ListenerHandle};
pub(crate) use buffer::BufferSink;
pub use executor::JobExecutor;
pub(crate) use executor::truncate;
pub use manager::JobManager;
pub use stream::{EventStream, JobStream};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::llm::Usage;

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet picked up.
    Queued,
    /// The agent call is in flight.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Check if this status allows transitioning to another status.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A background execution request and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub agent_name: String,
    pub input: String,
    pub conversation_id: Option<String>,
    /// Tenant / isolation key.
    pub scope_id: Option<String>,
    /// Replaces the agent's default system prompt.
    pub system_override: Option<String>,
    /// Model override passed to the agent runner.
    pub model: Option<String>,
    pub status: JobStatus,
    pub result: Option<String>,
    pub usage: Usage,
    pub tools_used: Vec<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a queued job.
    pub fn new(agent_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_name: agent_name.into(),
            input: input.into(),
            conversation_id: None,
            scope_id: None,
            system_override: None,
            model: None,
            status: JobStatus::Queued,
            result: None,
            usage: Usage::default(),
            tools_used: Vec::new(),
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_override = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Move to `target`, stamping `started_at` / `completed_at`.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                state: self.status.to_string(),
                target: target.to_string(),
            });
        }

        self.status = target;
        match target {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            JobStatus::Queued => {}
        }
        Ok(())
    }
}
