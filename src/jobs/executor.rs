//! Drives one background job to its terminal state.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvocation, AgentService, DelegationContext};
use crate::hooks::{
    self, EventScope, EventSink, HookEmitter, HookLevel, JobCancelled, JobEnd, JobStart,
    RedactionSettings,
};
use crate::jobs::buffer::{BufferSink, EventBuffer};
use crate::jobs::{Job, JobStatus};
use crate::store::JobStore;

/// Truncate to at most `max_chars` characters.
pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((index, _)) => s[..index].to_string(),
        None => s.to_string(),
    }
}

/// Runs jobs.
///
/// Exactly one terminal path runs per job: `completed` (`job:end`, `done`),
/// `failed` (`agent:error`, `error`) or `cancelled` (`job:cancelled`,
/// `cancelled`). Cancellation observed after the agent call wins over both
/// its success and its failure. Store write failures are logged and do not
/// change the outcome.
pub struct JobExecutor {
    agents: Arc<AgentService>,
    store: Arc<dyn JobStore>,
    buffer: EventBuffer,
    sink: Arc<dyn EventSink>,
    redaction: Option<RedactionSettings>,
    result_max_chars: usize,
}

impl JobExecutor {
    pub fn new(
        agents: Arc<AgentService>,
        store: Arc<dyn JobStore>,
        buffer: EventBuffer,
        sink: Arc<dyn EventSink>,
        result_max_chars: usize,
    ) -> Self {
        Self {
            agents,
            store,
            buffer,
            sink,
            redaction: None,
            result_max_chars,
        }
    }

    /// Redact events before they are copied into the job buffer.
    pub fn with_redaction(mut self, redaction: Option<RedactionSettings>) -> Self {
        self.redaction = redaction;
        self
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    fn job_bus(&self, job: &Job) -> Arc<HookEmitter> {
        let mirror = BufferSink::new(self.buffer.clone(), job.id);
        let mirror: Arc<dyn EventSink> = match &self.redaction {
            Some(settings) => Arc::new(settings.wrap(mirror)),
            None => Arc::new(mirror),
        };
        Arc::new(
            HookEmitter::new(HookLevel::Trace)
                .with_forward(Arc::clone(&self.sink))
                .with_forward(mirror),
        )
    }

    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.update(job).await {
            tracing::warn!(job_id = %job.id, status = %job.status, error = %e, "Failed to persist job");
        }
    }

    fn scope(job: &Job) -> EventScope {
        EventScope {
            agent_name: job.agent_name.clone(),
            conversation_id: job.conversation_id.clone(),
            scope_id: job.scope_id.clone(),
            job_id: Some(job.id),
        }
    }

    /// Run `job` until it completes, fails or is cancelled, and return the
    /// final record.
    pub async fn execute(&self, mut job: Job, cancel: CancellationToken) -> Job {
        let bus = self.job_bus(&job);

        // Cancelled while still queued: never call the model.
        if cancel.is_cancelled() {
            self.finish_cancelled(&mut job, &bus).await;
            return job;
        }

        if let Err(e) = job.transition_to(JobStatus::Running) {
            tracing::warn!(job_id = %job.id, error = %e, "Job not runnable");
            return job;
        }
        self.persist(&job).await;

        self.buffer.push(
            job.id,
            "start",
            &json!({ "job_id": job.id, "agent_name": job.agent_name }),
        );
        bus.emit(JobStart {
            timestamp: Utc::now(),
            scope: Self::scope(&job),
            input: job.input.clone(),
        });
        tracing::info!(job_id = %job.id, agent = %job.agent_name, "Job started");

        let ctx = DelegationContext::root(&job.agent_name, Arc::clone(&bus), cancel.clone())
            .with_conversation(job.conversation_id.clone())
            .with_scope(job.scope_id.clone())
            .with_job(job.id);
        let invocation = AgentInvocation::new(&job.agent_name, &job.input)
            .with_system(job.system_override.clone())
            .with_model(job.model.clone());

        let started = Instant::now();
        let result = self.agents.run_agent(&ctx, invocation).await;

        if cancel.is_cancelled() {
            self.finish_cancelled(&mut job, &bus).await;
            return job;
        }

        match result {
            Ok(response) => {
                let result = truncate(&response.response, self.result_max_chars);
                job.result = Some(result.clone());
                job.usage = response.usage;
                job.tools_used = response.tools_used;
                self.finish(&mut job, JobStatus::Completed).await;

                bus.emit(JobEnd {
                    timestamp: Utc::now(),
                    scope: Self::scope(&job),
                    result: result.clone(),
                    usage: job.usage,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                self.buffer.push(
                    job.id,
                    "done",
                    &json!({
                        "job_id": job.id,
                        "result": result,
                        "usage": job.usage,
                        "tools_used": job.tools_used,
                    }),
                );
                tracing::info!(job_id = %job.id, "Job completed");
            }
            Err(e) => {
                let error = e.to_string();
                job.error = Some(error.clone());
                self.finish(&mut job, JobStatus::Failed).await;

                bus.emit(hooks::AgentError {
                    timestamp: Utc::now(),
                    scope: Self::scope(&job),
                    error: error.clone(),
                });
                self.buffer
                    .push(job.id, "error", &json!({ "job_id": job.id, "error": error }));
                tracing::warn!(job_id = %job.id, error = %error, "Job failed");
            }
        }
        job
    }

    async fn finish(&self, job: &mut Job, status: JobStatus) {
        if let Err(e) = job.transition_to(status) {
            tracing::warn!(job_id = %job.id, error = %e, "Unexpected job transition");
        }
        self.persist(job).await;
    }

    async fn finish_cancelled(&self, job: &mut Job, bus: &HookEmitter) {
        self.finish(job, JobStatus::Cancelled).await;
        bus.emit(JobCancelled {
            timestamp: Utc::now(),
            scope: Self::scope(job),
        });
        self.buffer
            .push(job.id, "cancelled", &json!({ "job_id": job.id }));
        tracing::info!(job_id = %job.id, "Job cancelled");
    }
}
