//! In-memory stores.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cron::{CronExecution, CronJob};
use crate::error::StoreError;
use crate::jobs::Job;
use crate::store::{CronStore, JobStore};

fn not_found(entity: &str, id: Uuid) -> StoreError {
    StoreError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

fn conflict(entity: &str, id: Uuid) -> StoreError {
    StoreError::Conflict {
        entity: entity.to_string(),
        id: id.to_string(),
    }
}

/// Job store backed by a map.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(conflict("job", job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let slot = jobs.get_mut(&job.id).ok_or_else(|| not_found("job", job.id))?;
        *slot = job.clone();
        Ok(())
    }

    async fn list(&self, scope_id: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| scope_id.is_none() || job.scope_id.as_deref() == scope_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }
}

/// Cron store backed by maps.
#[derive(Default)]
pub struct InMemoryCronStore {
    jobs: RwLock<HashMap<Uuid, CronJob>>,
    executions: RwLock<HashMap<Uuid, Vec<CronExecution>>>,
}

impl InMemoryCronStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CronStore for InMemoryCronStore {
    async fn create(&self, job: &CronJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(conflict("cron_job", job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<CronJob>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn update(&self, job: &CronJob) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        let slot = jobs
            .get_mut(&job.id)
            .ok_or_else(|| not_found("cron_job", job.id))?;
        *slot = job.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let existed = self.jobs.write().await.remove(&id).is_some();
        self.executions.write().await.remove(&id);
        Ok(existed)
    }

    async fn list(&self, scope_id: Option<&str>) -> Result<Vec<CronJob>, StoreError> {
        let mut jobs: Vec<CronJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| scope_id.is_none() || job.scope_id.as_deref() == scope_id)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn get_due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<CronJob>, StoreError> {
        let mut due: Vec<CronJob> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(due)
    }

    async fn add_execution(&self, execution: &CronExecution) -> Result<(), StoreError> {
        self.executions
            .write()
            .await
            .entry(execution.cron_id)
            .or_default()
            .push(execution.clone());
        Ok(())
    }

    async fn update_execution(&self, execution: &CronExecution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let slot = executions
            .get_mut(&execution.cron_id)
            .and_then(|runs| runs.iter_mut().find(|run| run.id == execution.id))
            .ok_or_else(|| not_found("cron_execution", execution.id))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn list_executions(
        &self,
        cron_id: Uuid,
        limit: usize,
    ) -> Result<Vec<CronExecution>, StoreError> {
        Ok(self
            .executions
            .read()
            .await
            .get(&cron_id)
            .map(|runs| runs.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::fixtures::cron_job;
    use crate::cron::{Cadence, CronRunStatus};
    use chrono::Duration;

    #[tokio::test]
    async fn test_job_store_crud_and_scope_filter() {
        let store = InMemoryJobStore::new();
        let a = Job::new("writer", "one").with_scope("tenant-a");
        let b = Job::new("writer", "two").with_scope("tenant-b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();
        assert!(matches!(
            store.create(&a).await,
            Err(StoreError::Conflict { .. })
        ));

        let scoped = store.list(Some("tenant-a")).await.unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].id, a.id);
        assert_eq!(store.list(None).await.unwrap().len(), 2);

        let mut updated = a.clone();
        updated.result = Some("done".to_string());
        store.update(&updated).await.unwrap();
        assert_eq!(store.get(a.id).await.unwrap().unwrap().result.as_deref(), Some("done"));

        assert!(store.delete(a.id).await.unwrap());
        assert!(!store.delete(a.id).await.unwrap());
        assert!(matches!(
            store.update(&updated).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_due_jobs_and_history() {
        let store = InMemoryCronStore::new();
        let now = Utc::now();

        let mut recurring = cron_job(Cadence::Schedule("* * * * *".to_string()));
        recurring.next_run = Some(now - Duration::minutes(1));
        let mut later = cron_job(Cadence::Schedule("* * * * *".to_string()));
        later.next_run = Some(now + Duration::minutes(5));
        let one_off = cron_job(Cadence::RunAt(now - Duration::seconds(1)));
        for job in [&recurring, &later, &one_off] {
            store.create(job).await.unwrap();
        }

        let due: Vec<Uuid> = store
            .get_due_jobs(now)
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(due.len(), 2);
        assert!(due.contains(&recurring.id));
        assert!(due.contains(&one_off.id));

        let mut run = CronExecution::started(recurring.id, now);
        store.add_execution(&run).await.unwrap();
        run.status = CronRunStatus::Completed;
        store.update_execution(&run).await.unwrap();
        store
            .add_execution(&CronExecution::started(recurring.id, now + Duration::minutes(1)))
            .await
            .unwrap();

        let history = store.list_executions(recurring.id, 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].status, CronRunStatus::Completed);
        assert_eq!(store.list_executions(recurring.id, 1).await.unwrap().len(), 1);

        assert!(store.delete(recurring.id).await.unwrap());
        assert!(store.list_executions(recurring.id, 10).await.unwrap().is_empty());
    }
}
