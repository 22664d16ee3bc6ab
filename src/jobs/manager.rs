//! Job manager for submitting and tracking background jobs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, JobError};
use crate::jobs::buffer::EventBuffer;
use crate::jobs::executor::JobExecutor;
use crate::jobs::{Job, JobStatus};
use crate::store::JobStore;

/// Owns the cancellation tokens of in-flight jobs.
pub struct JobManager {
    executor: Arc<JobExecutor>,
    store: Arc<dyn JobStore>,
    /// Tokens for jobs that are queued or running.
    active: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
    /// How long a finished job's buffer is kept.
    buffer_retention: Duration,
}

impl JobManager {
    pub fn new(
        executor: Arc<JobExecutor>,
        store: Arc<dyn JobStore>,
        buffer_retention: Duration,
    ) -> Self {
        Self {
            executor,
            store,
            active: Arc::new(RwLock::new(HashMap::new())),
            buffer_retention,
        }
    }

    pub fn buffer(&self) -> &EventBuffer {
        self.executor.buffer()
    }

    /// Persist `job` and start it in the background.
    ///
    /// Returns the queued record immediately.
    pub async fn submit(&self, job: Job) -> Result<Job, Error> {
        self.store.create(&job).await?;

        let cancel = CancellationToken::new();
        self.active.write().await.insert(job.id, cancel.clone());

        let executor = Arc::clone(&self.executor);
        let active = Arc::clone(&self.active);
        let retention = self.buffer_retention;
        let queued = job.clone();
        tokio::spawn(async move {
            let job_id = job.id;
            let finished = executor.execute(job, cancel).await;
            active.write().await.remove(&job_id);
            tracing::debug!(job_id = %job_id, status = %finished.status, "Job task finished");

            tokio::time::sleep(retention).await;
            executor.buffer().cleanup(job_id);
        });

        tracing::info!(job_id = %queued.id, agent = %queued.agent_name, "Job submitted");
        Ok(queued)
    }

    /// Request cancellation of a job.
    ///
    /// Cooperative: a running job stops at its next checkpoint. A terminal
    /// job is returned unchanged. A queued job nobody is executing is
    /// cancelled in the store directly.
    pub async fn cancel(&self, id: Uuid) -> Result<Job, Error> {
        let mut job = self.get(id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }

        if let Some(token) = self.active.read().await.get(&id) {
            token.cancel();
            tracing::info!(job_id = %id, "Job cancellation requested");
            return Ok(job);
        }

        if job.status == JobStatus::Queued {
            job.transition_to(JobStatus::Cancelled)?;
            self.store.update(&job).await?;
        }
        Ok(job)
    }

    pub async fn get(&self, id: Uuid) -> Result<Job, Error> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound { id }.into())
    }

    /// Jobs, optionally restricted to one scope.
    pub async fn list(&self, scope_id: Option<&str>) -> Result<Vec<Job>, Error> {
        Ok(self.store.list(scope_id).await?)
    }

    /// Number of jobs still queued or running.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    pub async fn is_active(&self, id: Uuid) -> bool {
        self.active.read().await.contains_key(&id)
    }
}
