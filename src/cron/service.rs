//! CRUD over cron jobs with schedule validation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cron::expression::next_run;
use crate::cron::{Cadence, CronExecution, CronJob};
use crate::error::{CronError, Error};
use crate::store::CronStore;

/// Fields for a new cron job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCronJob {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cadence: Cadence,
    pub agent_name: String,
    pub input: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub scope_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl NewCronJob {
    pub fn new(
        name: impl Into<String>,
        cadence: Cadence,
        agent_name: impl Into<String>,
        input: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            cadence,
            agent_name: agent_name.into(),
            input: input.into(),
            model: None,
            timezone: None,
            scope_id: None,
            enabled: true,
        }
    }

    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }
}

/// Partial update; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronJobUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub cadence: Option<Cadence>,
    pub agent_name: Option<String>,
    pub input: Option<String>,
    pub model: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
}

/// First run of `cadence` strictly after `now`, or the one-off instant.
fn schedule_next(
    cadence: &Cadence,
    now: DateTime<Utc>,
    timezone: Option<&str>,
) -> Result<DateTime<Utc>, CronError> {
    match cadence {
        Cadence::Schedule(expr) => next_run(expr, now, timezone),
        Cadence::RunAt(at) => Ok(*at),
    }
}

fn require(field: &str, value: &str) -> Result<(), CronError> {
    if value.trim().is_empty() {
        return Err(CronError::InvalidJob {
            reason: format!("{field} must not be empty"),
        });
    }
    Ok(())
}

/// Manages cron job definitions. Execution is the dispatcher's job.
pub struct CronService {
    store: Arc<dyn CronStore>,
}

impl CronService {
    pub fn new(store: Arc<dyn CronStore>) -> Self {
        Self { store }
    }

    /// Validate and persist a cron job, computing its first `next_run`.
    pub async fn create(&self, new: NewCronJob) -> Result<CronJob, Error> {
        require("name", &new.name)?;
        require("agent_name", &new.agent_name)?;

        let now = Utc::now();
        let next = schedule_next(&new.cadence, now, new.timezone.as_deref())?;
        let job = CronJob {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            cadence: new.cadence,
            agent_name: new.agent_name,
            input: new.input,
            model: new.model,
            enabled: new.enabled,
            timezone: new.timezone,
            scope_id: new.scope_id,
            last_run: None,
            next_run: Some(next),
            created_at: now,
            updated_at: now,
        };
        self.store.create(&job).await?;

        tracing::info!(cron_id = %job.id, name = %job.name, next_run = %next, "Cron job created");
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<CronJob, Error> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CronError::NotFound { id }.into())
    }

    /// Apply `update`. A changed cadence or timezone is revalidated and
    /// `next_run` recomputed.
    pub async fn update(&self, id: Uuid, update: CronJobUpdate) -> Result<CronJob, Error> {
        let mut job = self.get(id).await?;
        let reschedule =
            update.cadence.is_some() || update.timezone.is_some() || update.enabled == Some(true);

        if let Some(name) = update.name {
            require("name", &name)?;
            job.name = name;
        }
        if let Some(agent_name) = update.agent_name {
            require("agent_name", &agent_name)?;
            job.agent_name = agent_name;
        }
        if let Some(description) = update.description {
            job.description = description;
        }
        if let Some(input) = update.input {
            job.input = input;
        }
        if let Some(model) = update.model {
            job.model = Some(model);
        }
        if let Some(timezone) = update.timezone {
            job.timezone = Some(timezone);
        }
        if let Some(cadence) = update.cadence {
            // A new cadence starts a fresh one-off lifecycle.
            job.last_run = None;
            job.cadence = cadence;
        }
        if let Some(enabled) = update.enabled {
            job.enabled = enabled;
        }

        let now = Utc::now();
        if reschedule {
            job.next_run = Some(schedule_next(&job.cadence, now, job.timezone.as_deref())?);
        }
        job.updated_at = now;
        self.store.update(&job).await?;

        tracing::debug!(cron_id = %job.id, enabled = job.enabled, "Cron job updated");
        Ok(job)
    }

    pub async fn enable(&self, id: Uuid) -> Result<CronJob, Error> {
        self.update(
            id,
            CronJobUpdate {
                enabled: Some(true),
                ..CronJobUpdate::default()
            },
        )
        .await
    }

    pub async fn disable(&self, id: Uuid) -> Result<CronJob, Error> {
        self.update(
            id,
            CronJobUpdate {
                enabled: Some(false),
                ..CronJobUpdate::default()
            },
        )
        .await
    }

    /// Returns `true` if the job existed.
    pub async fn delete(&self, id: Uuid) -> Result<bool, Error> {
        let deleted = self.store.delete(id).await?;
        if deleted {
            tracing::info!(cron_id = %id, "Cron job deleted");
        }
        Ok(deleted)
    }

    pub async fn list(&self, scope_id: Option<&str>) -> Result<Vec<CronJob>, Error> {
        Ok(self.store.list(scope_id).await?)
    }

    /// Execution history, newest first.
    pub async fn history(&self, id: Uuid, limit: usize) -> Result<Vec<CronExecution>, Error> {
        self.get(id).await?;
        Ok(self.store.list_executions(id, limit).await?)
    }
}
