//! Runs due cron jobs.
//!
//! A tick is one logical unit: load due jobs, run them one after another,
//! record each run and reschedule. Ticks never overlap; a tick that starts
//! while another is in flight is skipped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentInvocation, AgentService, DelegationContext};
use crate::cron::expression::next_run;
use crate::cron::{Cadence, CronExecution, CronJob, CronRunStatus};
use crate::hooks::{self, CronExecuted, EventSink, HookEmitter, HookLevel, RedactionSettings};
use crate::jobs::{BufferSink, EventBuffer, truncate};
use crate::store::CronStore;

const DEFAULT_BUFFER_RETENTION: Duration = Duration::from_secs(300);

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Jobs run to success.
    pub executed: usize,
    /// Jobs whose run failed.
    pub failed: usize,
    /// The tick did nothing because a previous tick was still running.
    pub skipped: bool,
}

pub struct CronDispatcher {
    agents: Arc<AgentService>,
    store: Arc<dyn CronStore>,
    sink: Arc<dyn EventSink>,
    summary_max_chars: usize,
    /// Per-run event logs, keyed by execution id.
    buffer: EventBuffer,
    buffer_retention: Duration,
    redaction: Option<RedactionSettings>,
    tick_lock: Mutex<()>,
}

impl CronDispatcher {
    pub fn new(
        agents: Arc<AgentService>,
        store: Arc<dyn CronStore>,
        sink: Arc<dyn EventSink>,
        summary_max_chars: usize,
    ) -> Self {
        Self {
            agents,
            store,
            sink,
            summary_max_chars,
            buffer: EventBuffer::new(),
            buffer_retention: DEFAULT_BUFFER_RETENTION,
            redaction: None,
            tick_lock: Mutex::new(()),
        }
    }

    /// How long a finished run's event log stays replayable.
    pub fn with_buffer_retention(mut self, retention: Duration) -> Self {
        self.buffer_retention = retention;
        self
    }

    /// Redact events before they are copied into run logs.
    pub fn with_redaction(mut self, redaction: Option<RedactionSettings>) -> Self {
        self.redaction = redaction;
        self
    }

    pub fn buffer(&self) -> &EventBuffer {
        &self.buffer
    }

    /// Run every job due at `now`.
    ///
    /// Safe to call from an external scheduler as well as the interval
    /// task; both go through the same lock.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let Ok(_guard) = self.tick_lock.try_lock() else {
            tracing::warn!("Previous cron tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let due = match self.store.get_due_jobs(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load due cron jobs");
                return TickReport::default();
            }
        };
        if !due.is_empty() {
            tracing::info!(count = due.len(), "Running due cron jobs");
        }

        let mut report = TickReport::default();
        for job in due {
            if self.run_job(job, now).await {
                report.executed += 1;
            } else {
                report.failed += 1;
            }
        }
        report
    }

    fn run_bus(&self, execution_id: Uuid) -> Arc<HookEmitter> {
        let mirror = BufferSink::new(self.buffer.clone(), execution_id);
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

    /// Run one cron job and record the outcome. Returns whether it succeeded.
    async fn run_job(&self, job: CronJob, now: DateTime<Utc>) -> bool {
        let mut execution = CronExecution::started(job.id, Utc::now());
        if let Err(e) = self.store.add_execution(&execution).await {
            tracing::error!(cron_id = %job.id, error = %e, "Failed to record cron execution");
        }

        let bus = self.run_bus(execution.id);
        self.buffer.push(
            execution.id,
            "start",
            &json!({ "cron_id": job.id, "execution_id": execution.id, "agent_name": job.agent_name }),
        );

        let ctx = DelegationContext::root(&job.agent_name, Arc::clone(&bus), CancellationToken::new())
            .with_scope(job.scope_id.clone());
        let invocation =
            AgentInvocation::new(&job.agent_name, &job.input).with_model(job.model.clone());

        let started = Instant::now();
        let result = self.agents.run_agent(&ctx, invocation).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        execution.completed_at = Some(Utc::now());
        let success = match &result {
            Ok(response) => {
                execution.status = CronRunStatus::Completed;
                execution.summary = Some(truncate(&response.response, self.summary_max_chars));
                tracing::info!(cron_id = %job.id, name = %job.name, duration_ms, "Cron job completed");
                true
            }
            Err(e) => {
                execution.status = CronRunStatus::Failed;
                execution.error = Some(e.to_string());
                tracing::warn!(cron_id = %job.id, name = %job.name, error = %e, "Cron job failed");
                false
            }
        };
        if let Err(e) = self.store.update_execution(&execution).await {
            tracing::error!(cron_id = %job.id, error = %e, "Failed to complete cron execution");
        }

        self.reschedule(&job, now).await;

        let scope = ctx.scope(&job.agent_name);
        if let Some(error) = &execution.error {
            bus.emit(hooks::AgentError {
                timestamp: Utc::now(),
                scope: scope.clone(),
                error: error.clone(),
            });
        }
        bus.emit(CronExecuted {
            timestamp: Utc::now(),
            scope,
            cron_id: job.id,
            execution_id: execution.id,
            cron_name: job.name.clone(),
            success,
            summary: execution.summary.clone(),
            error: execution.error.clone(),
            duration_ms,
        });

        match &execution.error {
            None => self.buffer.push(
                execution.id,
                "done",
                &json!({
                    "cron_id": job.id,
                    "execution_id": execution.id,
                    "summary": execution.summary,
                }),
            ),
            Some(error) => self.buffer.push(
                execution.id,
                "error",
                &json!({ "cron_id": job.id, "execution_id": execution.id, "error": error }),
            ),
        };
        self.schedule_cleanup(execution.id);
        success
    }

    fn schedule_cleanup(&self, execution_id: Uuid) {
        let buffer = self.buffer.clone();
        let retention = self.buffer_retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            buffer.cleanup(execution_id);
        });
    }

    /// Stamp `last_run` and compute what happens next.
    ///
    /// Works on the stored record as it is after the run, so edits made
    /// while the agent was running survive. A job deleted or disabled in
    /// the meantime is left alone, and so is one whose cadence was
    /// replaced: the edit already computed its schedule.
    async fn reschedule(&self, ran: &CronJob, now: DateTime<Utc>) {
        let mut job = match self.store.get(ran.id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(cron_id = %ran.id, "Cron job deleted during its run");
                return;
            }
            Err(e) => {
                tracing::error!(cron_id = %ran.id, error = %e, "Failed to reload cron job");
                return;
            }
        };
        if !job.enabled || job.cadence != ran.cadence {
            tracing::debug!(cron_id = %job.id, "Cron job changed during its run, not rescheduling");
            return;
        }

        job.last_run = Some(now);
        job.updated_at = Utc::now();
        match &job.cadence {
            Cadence::RunAt(_) => {
                job.enabled = false;
                job.next_run = None;
            }
            Cadence::Schedule(expr) => match next_run(expr, now, job.timezone.as_deref()) {
                Ok(next) => job.next_run = Some(next),
                Err(e) => {
                    tracing::warn!(cron_id = %job.id, error = %e, "Cannot reschedule cron job, disabling");
                    job.enabled = false;
                    job.next_run = None;
                }
            },
        }
        if let Err(e) = self.store.update(&job).await {
            tracing::error!(cron_id = %job.id, error = %e, "Failed to update cron job");
        }
    }

    /// Tick every `interval` until `shutdown` is cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Cron dispatcher stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.tick(Utc::now()).await;
                        tracing::debug!(?report, "Cron tick finished");
                    }
                }
            }
        })
    }
}
