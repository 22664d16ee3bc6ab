//! The assembled runtime.
//!
//! [`Runtime`] wires the agent service, job manager, cron service and
//! dispatcher, conversation compaction and the process-wide hook emitter
//! around caller-supplied collaborators ([`RuntimeDeps`]). Every request
//! path (synchronous, streamed, background job, cron) ends up in
//! [`AgentService::run_agent`].

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{
    AgentInvocation, AgentRegistry, AgentRunResponse, AgentRunner, AgentService,
    DelegationContext,
};
use crate::config::Config;
use crate::conversation::{
    CompactionOptions, CompactionResult, Compactor, ConversationStore, Message,
};
use crate::cron::{CronDispatcher, CronService, TickReport};
use crate::error::Error;
use crate::hooks::{self, EventSink, HookEmitter, HookLevel, RedactionSettings};
use crate::jobs::{BufferSink, EventBuffer, EventStream, Job, JobExecutor, JobManager, JobStream};
use crate::store::{CronStore, JobStore};

/// Collaborators the runtime is built around.
pub struct RuntimeDeps {
    pub agents: Arc<dyn AgentRegistry>,
    pub runner: Arc<dyn AgentRunner>,
    pub jobs: Arc<dyn JobStore>,
    pub crons: Arc<dyn CronStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

/// A synchronous or streamed agent request.
#[derive(Debug, Clone, Default)]
pub struct InvokeRequest {
    pub agent_name: String,
    pub input: String,
    /// When set, prior messages are passed as history and the exchange is
    /// recorded afterwards.
    pub conversation_id: Option<String>,
    pub scope_id: Option<String>,
    pub system_override: Option<String>,
    pub model: Option<String>,
}

impl InvokeRequest {
    pub fn new(agent_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            input: input.into(),
            ..Self::default()
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
}

pub struct Runtime {
    config: Config,
    hooks: Arc<HookEmitter>,
    /// Where per-request buses forward: the hook emitter, behind redaction
    /// when enabled.
    sink: Arc<dyn EventSink>,
    redaction: Option<RedactionSettings>,
    agents: Arc<AgentService>,
    jobs: JobManager,
    crons: CronService,
    dispatcher: Arc<CronDispatcher>,
    conversations: Arc<dyn ConversationStore>,
    compactor: Compactor,
    /// Logs for streamed invocations, keyed by a per-request id.
    streams: EventBuffer,
}

impl Runtime {
    pub fn new(deps: RuntimeDeps, config: Config) -> Self {
        let hooks = Arc::new(HookEmitter::new(config.hooks.level));
        let redaction = config.hooks.redact.then(|| {
            RedactionSettings::builtin(
                &config.hooks.patterns,
                config.hooks.passthrough_fields.clone(),
            )
        });
        let sink: Arc<dyn EventSink> = match &redaction {
            Some(settings) => Arc::new(settings.wrap(Arc::clone(&hooks))),
            None => hooks.clone(),
        };

        let agents = Arc::new(AgentService::new(
            deps.agents,
            Arc::clone(&deps.runner),
            config.resilience.clone(),
            config.agent.max_delegation_depth,
        ));

        let executor = JobExecutor::new(
            Arc::clone(&agents),
            Arc::clone(&deps.jobs),
            EventBuffer::new(),
            Arc::clone(&sink),
            config.jobs.result_max_chars,
        )
        .with_redaction(redaction.clone());
        let jobs = JobManager::new(Arc::new(executor), deps.jobs, config.jobs.buffer_retention);

        let dispatcher = Arc::new(
            CronDispatcher::new(
                Arc::clone(&agents),
                Arc::clone(&deps.crons),
                Arc::clone(&sink),
                config.cron.summary_max_chars,
            )
            .with_buffer_retention(config.jobs.buffer_retention)
            .with_redaction(redaction.clone()),
        );

        let compactor = Compactor::new(
            Arc::clone(&deps.conversations),
            deps.runner,
            config.resilience.clone(),
            Arc::new(HookEmitter::default().with_forward(Arc::clone(&sink))),
        );

        tracing::debug!(
            level = %config.hooks.level,
            redact = config.hooks.redact,
            max_delegation_depth = config.agent.max_delegation_depth,
            "Runtime assembled"
        );

        Self {
            crons: CronService::new(deps.crons),
            conversations: deps.conversations,
            streams: EventBuffer::new(),
            config,
            hooks,
            sink,
            redaction,
            agents,
            jobs,
            dispatcher,
            compactor,
        }
    }

    /// The process-wide emitter. Subscribe here to observe every request.
    pub fn hooks(&self) -> &Arc<HookEmitter> {
        &self.hooks
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn agents(&self) -> &Arc<AgentService> {
        &self.agents
    }

    pub fn crons(&self) -> &CronService {
        &self.crons
    }

    /// A fresh per-request bus forwarding to the hook emitter.
    fn request_bus(&self) -> Arc<HookEmitter> {
        Arc::new(HookEmitter::default().with_forward(Arc::clone(&self.sink)))
    }

    async fn history(&self, conversation_id: Option<&str>) -> Vec<Message> {
        let Some(id) = conversation_id else {
            return Vec::new();
        };
        match self.conversations.get(id).await {
            Ok(messages) => messages.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(conversation_id = %id, error = %e, "Failed to load conversation");
                Vec::new()
            }
        }
    }

    async fn run(
        &self,
        request: InvokeRequest,
        bus: Arc<HookEmitter>,
        cancel: CancellationToken,
    ) -> Result<AgentRunResponse, Error> {
        let history = self.history(request.conversation_id.as_deref()).await;
        let ctx = DelegationContext::root(&request.agent_name, bus, cancel)
            .with_conversation(request.conversation_id.clone())
            .with_scope(request.scope_id.clone());
        let invocation = AgentInvocation::new(&request.agent_name, &request.input)
            .with_system(request.system_override.clone())
            .with_model(request.model.clone())
            .with_history(history);

        match self.agents.run_agent(&ctx, invocation).await {
            Ok(response) => {
                if let Some(id) = &request.conversation_id {
                    self.record_exchange(id, &request.input, &response.response)
                        .await;
                }
                Ok(response)
            }
            Err(e) => {
                if !e.is_cancelled() {
                    ctx.bus.emit(hooks::AgentError {
                        timestamp: Utc::now(),
                        scope: ctx.scope(&request.agent_name),
                        error: e.to_string(),
                    });
                }
                Err(e)
            }
        }
    }

    /// Run an agent and wait for its response.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<AgentRunResponse, Error> {
        self.run(request, self.request_bus(), CancellationToken::new())
            .await
    }

    /// Run an agent in a background task and stream its progress.
    ///
    /// The stream carries every lifecycle event of the request (tagged with
    /// its wire name) and ends with `done`, `error` or `cancelled`. Dropping
    /// the stream cancels the request.
    pub fn invoke_streamed(self: &Arc<Self>, request: InvokeRequest) -> EventStream {
        let stream_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let stream = EventStream::attach(&self.streams, stream_id).cancel_on_drop(cancel.clone());

        let mirror = BufferSink::new(self.streams.clone(), stream_id);
        let mirror: Arc<dyn EventSink> = match &self.redaction {
            Some(settings) => Arc::new(settings.wrap(mirror)),
            None => Arc::new(mirror),
        };
        let bus = Arc::new(
            HookEmitter::new(HookLevel::Trace)
                .with_forward(Arc::clone(&self.sink))
                .with_forward(mirror),
        );

        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let result = runtime.run(request, bus, cancel).await;
            let (event, data) = match result {
                Ok(response) => (
                    "done",
                    json!({
                        "result": response.response,
                        "usage": response.usage,
                        "tools_used": response.tools_used,
                    }),
                ),
                Err(e) if e.is_cancelled() => ("cancelled", json!({})),
                Err(e) => ("error", json!({ "error": e.to_string() })),
            };
            runtime.streams.push(stream_id, event, &data);
            runtime.streams.cleanup(stream_id);
        });
        stream
    }

    /// Persist `job` and run it in the background.
    pub async fn submit_job(&self, job: Job) -> Result<Job, Error> {
        self.jobs.submit(job).await
    }

    pub async fn cancel_job(&self, id: Uuid) -> Result<Job, Error> {
        self.jobs.cancel(id).await
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Job, Error> {
        self.jobs.get(id).await
    }

    pub async fn list_jobs(&self, scope_id: Option<&str>) -> Result<Vec<Job>, Error> {
        self.jobs.list(scope_id).await
    }

    /// Stream a job: replay its buffer then follow live events.
    ///
    /// A job with no buffered events that is either finished or not owned
    /// by this runtime's executor is returned as a snapshot.
    pub async fn stream_job(&self, id: Uuid) -> Result<JobStream, Error> {
        let job = self.jobs.get(id).await?;
        if !self.jobs.buffer().contains(id)
            && (job.status.is_terminal() || !self.jobs.is_active(id).await)
        {
            return Ok(JobStream::Snapshot(job));
        }
        Ok(JobStream::Live(EventStream::attach(self.jobs.buffer(), id)))
    }

    /// Stream one cron run by its execution id.
    ///
    /// `None` once the run's log has expired, or for an id that never ran.
    pub fn stream_cron_run(&self, execution_id: Uuid) -> Option<EventStream> {
        let buffer = self.dispatcher.buffer();
        buffer
            .contains(execution_id)
            .then(|| EventStream::attach(buffer, execution_id))
    }

    /// Run due cron jobs now.
    pub async fn tick(&self) -> TickReport {
        self.dispatcher.tick(Utc::now()).await
    }

    /// Start the interval dispatcher, unless cron is disabled.
    pub fn spawn_dispatcher(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.cron.enabled {
            tracing::info!("Cron dispatcher disabled");
            return None;
        }
        Some(Arc::clone(&self.dispatcher).spawn(self.config.cron.tick_interval, shutdown))
    }

    fn compaction_options(&self) -> CompactionOptions {
        CompactionOptions {
            preserve_tokens: self.config.compaction.preserve_tokens,
            token_limit: self.config.compaction.token_limit,
            prompt: None,
            model: self.config.compaction.model.clone(),
        }
    }

    /// Compact a conversation with the configured budgets.
    pub async fn compact(&self, conversation_id: &str) -> Result<Option<CompactionResult>, Error> {
        self.compactor
            .compact(conversation_id, self.compaction_options())
            .await
    }

    async fn record_exchange(&self, conversation_id: &str, input: &str, response: &str) {
        let exchange = [Message::user(input), Message::assistant(response)];
        if let Err(e) = self.conversations.append(conversation_id, &exchange).await {
            tracing::warn!(conversation_id, error = %e, "Failed to record exchange");
            return;
        }
        if !self.config.compaction.auto {
            return;
        }

        let messages = match self.conversations.get(conversation_id).await {
            Ok(messages) => messages.unwrap_or_default(),
            Err(e) => {
                tracing::warn!(conversation_id, error = %e, "Failed to load conversation");
                return;
            }
        };
        if !Compactor::needs_compaction(&messages, self.config.compaction.token_limit) {
            return;
        }
        match self.compact(conversation_id).await {
            Ok(Some(result)) => tracing::info!(
                conversation_id,
                summarized = result.summarized_count,
                tokens_before = result.tokens_before,
                tokens_after = result.tokens_after,
                "Conversation compacted"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(conversation_id, error = %e, "Automatic compaction failed"),
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("handlers", &self.hooks.handler_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::InMemoryAgentRegistry;
    use crate::conversation::InMemoryConversationStore;
    use crate::error::{AgentError, JobError};
    use crate::hooks::{AgentEnd, EventKind};
    use crate::jobs::JobStatus;
    use crate::store::{InMemoryCronStore, InMemoryJobStore};
    use crate::testing::{StubRunner, test_agents, test_runtime};
    use futures::StreamExt;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_invoke_emits_on_global_hooks() {
        let runtime = test_runtime(Arc::new(StubRunner::new().with_response("hi")));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        runtime.hooks().on::<AgentEnd, _>(move |e| s.lock().unwrap().push(e.response.clone()));

        let response = runtime.invoke(InvokeRequest::new("writer", "hello")).await.unwrap();
        assert_eq!(response.response, "hi");
        assert_eq!(*seen.lock().unwrap(), vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn test_invoke_unknown_agent_reports_error() {
        let runtime = test_runtime(Arc::new(StubRunner::new()));
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kinds);
        runtime.hooks().on_any(move |e| k.lock().unwrap().push(e.kind()));

        let err = runtime.invoke(InvokeRequest::new("ghost", "x")).await.unwrap_err();
        assert!(matches!(err, Error::Agent(AgentError::NotFound { .. })));
        assert_eq!(*kinds.lock().unwrap(), vec![EventKind::AgentError]);
    }

    #[tokio::test]
    async fn test_conversation_history_is_recorded_and_replayed() {
        let runner = Arc::new(StubRunner::new());
        let runtime = test_runtime(Arc::clone(&runner));

        runtime
            .invoke(InvokeRequest::new("writer", "first").with_conversation("c1"))
            .await
            .unwrap();
        runtime
            .invoke(InvokeRequest::new("writer", "second").with_conversation("c1"))
            .await
            .unwrap();

        let requests = runner.requests();
        assert!(requests[0].history.is_empty());
        let history: Vec<&str> = requests[1].history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(history, vec!["first", "echo: first"]);
    }

    #[tokio::test]
    async fn test_streamed_invocation_ends_with_done() {
        let runtime = Arc::new(test_runtime(Arc::new(StubRunner::new().with_tool("search"))));
        let events: Vec<_> = runtime
            .invoke_streamed(InvokeRequest::new("writer", "go"))
            .collect()
            .await;

        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names.first(), Some(&"agent:start"));
        assert!(names.contains(&"tool:execute"));
        assert_eq!(names.last(), Some(&"done"));
        let done = events.last().unwrap().json().unwrap();
        assert_eq!(done["result"], "echo: go");
        assert_eq!(done["tools_used"], json!(["search"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_stream_is_not_an_error() {
        let runner = Arc::new(StubRunner::new().cancel_during_run());
        runner.push_error(crate::error::LlmError::Http {
            status: 503,
            message: "busy".to_string(),
        });
        let runtime = Arc::new(test_runtime(Arc::clone(&runner)));
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kinds);
        runtime.hooks().on_any(move |e| k.lock().unwrap().push(e.kind()));

        let events: Vec<_> = runtime
            .invoke_streamed(InvokeRequest::new("writer", "go"))
            .collect()
            .await;

        assert_eq!(events.last().map(|e| e.event.as_str()), Some("cancelled"));
        assert_eq!(runner.calls(), 1);
        assert!(!kinds.lock().unwrap().contains(&EventKind::AgentError));
    }

    #[tokio::test]
    async fn test_stream_job_snapshot_when_buffer_gone() {
        let store = Arc::new(InMemoryJobStore::new());
        let runtime = Runtime::new(
            RuntimeDeps {
                agents: Arc::new(InMemoryAgentRegistry::with_agents(test_agents())),
                runner: Arc::new(StubRunner::new()),
                jobs: Arc::clone(&store) as Arc<dyn JobStore>,
                crons: Arc::new(InMemoryCronStore::new()),
                conversations: Arc::new(InMemoryConversationStore::new()),
            },
            Config::default(),
        );
        let mut job = Job::new("writer", "old");
        job.transition_to(JobStatus::Running).unwrap();
        job.transition_to(JobStatus::Completed).unwrap();
        store.create(&job).await.unwrap();

        match runtime.stream_job(job.id).await.unwrap() {
            JobStream::Snapshot(snapshot) => assert_eq!(snapshot.id, job.id),
            JobStream::Live(_) => panic!("expected a snapshot"),
        }
        assert!(matches!(
            runtime.stream_job(Uuid::new_v4()).await,
            Err(Error::Job(JobError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_stream_unowned_queued_job_is_snapshot() {
        let store = Arc::new(InMemoryJobStore::new());
        let runtime = Runtime::new(
            RuntimeDeps {
                agents: Arc::new(InMemoryAgentRegistry::with_agents(test_agents())),
                runner: Arc::new(StubRunner::new()),
                jobs: Arc::clone(&store) as Arc<dyn JobStore>,
                crons: Arc::new(InMemoryCronStore::new()),
                conversations: Arc::new(InMemoryConversationStore::new()),
            },
            Config::default(),
        );
        // Queued by another process; no executor here owns it.
        let job = Job::new("writer", "elsewhere");
        store.create(&job).await.unwrap();

        match runtime.stream_job(job.id).await.unwrap() {
            JobStream::Snapshot(snapshot) => assert_eq!(snapshot.status, JobStatus::Queued),
            JobStream::Live(_) => panic!("expected a snapshot"),
        }
        assert!(!runtime.jobs.buffer().contains(job.id));
        assert_eq!(runtime.jobs.buffer().job_count(), 0);
    }

    #[tokio::test]
    async fn test_stream_cron_run_replays_execution() {
        use crate::cron::{Cadence, NewCronJob};

        let runtime = test_runtime(Arc::new(StubRunner::new().with_response("digest")));
        let due = Utc::now() - chrono::Duration::minutes(1);
        let cron = runtime
            .crons()
            .create(NewCronJob::new("digest", Cadence::RunAt(due), "writer", "summarize"))
            .await
            .unwrap();
        assert_eq!(runtime.tick().await.executed, 1);

        let execution = runtime.crons().history(cron.id, 1).await.unwrap().remove(0);
        let events: Vec<_> = runtime
            .stream_cron_run(execution.id)
            .expect("run log should be buffered")
            .collect()
            .await;
        assert_eq!(events.first().map(|e| e.event.as_str()), Some("start"));
        assert_eq!(events.last().map(|e| e.event.as_str()), Some("done"));

        assert!(runtime.stream_cron_run(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_dispatcher_respects_cron_enabled() {
        let mut runtime = test_runtime(Arc::new(StubRunner::new()));
        runtime.config.cron.enabled = false;
        assert!(runtime.spawn_dispatcher(CancellationToken::new()).is_none());
    }
}
