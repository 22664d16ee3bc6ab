//! Scheduled agent runs.
//!
//! ```text
//! ┌──────────────┐   tick(now)   ┌──────────────┐   run_agent   ┌──────────────┐
//! │ interval task│──────────────▶│  Dispatcher  │──────────────▶│ AgentService │
//! │ or /tick call│               │ due jobs, one│               └──────────────┘
//! └──────────────┘               │ at a time    │
//!                                └──────┬───────┘
//!                                       ▼
//!                         CronExecution history + next_run
//! ```
//!
//! A cron job either recurs on a five-field [`expression`] or fires once at
//! a fixed instant.

pub mod dispatcher;
pub mod expression;
pub mod service;

pub use dispatcher::{CronDispatcher, TickReport};
pub use expression::{CronExpression, next_run, validate};
pub use service::{CronJobUpdate, CronService, NewCronJob};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// When a cron job fires. Exactly one cadence per job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Recurring, on a five-field cron expression.
    Schedule(String),
    /// Once, at this instant.
    RunAt(DateTime<Utc>),
}

impl Cadence {
    pub fn is_one_off(&self) -> bool {
        matches!(self, Cadence::RunAt(_))
    }
}

/// A named scheduling rule pairing a cadence with an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronJob {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub cadence: Cadence,
    pub agent_name: String,
    pub input: String,
    pub model: Option<String>,
    pub enabled: bool,
    /// Accepted and stored; schedules are evaluated in UTC.
    pub timezone: Option<String>,
    pub scope_id: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CronJob {
    /// Whether the job should run at `now`.
    ///
    /// Recurring jobs are due once `next_run` has passed. One-off jobs are
    /// due once their instant has passed, if they have never run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match &self.cadence {
            Cadence::Schedule(_) => self.next_run.is_some_and(|next| next <= now),
            Cadence::RunAt(at) => *at <= now && self.last_run.is_none(),
        }
    }
}

/// One historical run of a cron job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronExecution {
    pub id: Uuid,
    pub cron_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: CronRunStatus,
    pub summary: Option<String>,
    pub error: Option<String>,
}

impl CronExecution {
    pub fn started(cron_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            cron_id,
            started_at,
            completed_at: None,
            status: CronRunStatus::Running,
            summary: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CronRunStatus {
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for CronRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
