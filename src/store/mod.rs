//! Storage boundary for jobs and cron schedules.
//!
//! The runtime only talks to these traits. [`memory`] holds the in-process
//! reference implementations; a persistent backend implements the same
//! traits and owns its own write serialization.

pub mod memory;

pub use memory::{InMemoryCronStore, InMemoryJobStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cron::{CronExecution, CronJob};
use crate::error::StoreError;
use crate::jobs::Job;

/// Persistence for background jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Overwrite an existing job.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Jobs newest first, optionally restricted to one scope.
    async fn list(&self, scope_id: Option<&str>) -> Result<Vec<Job>, StoreError>;

    /// Returns `true` if the job existed.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Persistence for cron jobs and their execution history.
#[async_trait]
pub trait CronStore: Send + Sync {
    async fn create(&self, job: &CronJob) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<CronJob>, StoreError>;

    async fn update(&self, job: &CronJob) -> Result<(), StoreError>;

    /// Returns `true` if the job existed. History is removed with it.
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list(&self, scope_id: Option<&str>) -> Result<Vec<CronJob>, StoreError>;

    /// Enabled jobs whose next run (or one-off instant, if never run) is at or before `now`.
    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>, StoreError>;

    async fn add_execution(&self, execution: &CronExecution) -> Result<(), StoreError>;

    /// Overwrite an existing execution record.
    async fn update_execution(&self, execution: &CronExecution) -> Result<(), StoreError>;

    /// History for one cron job, newest first, at most `limit` entries.
    async fn list_executions(
        &self,
        cron_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CronExecution>, StoreError>;
}
