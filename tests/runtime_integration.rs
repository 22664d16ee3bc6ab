//! End-to-end tests driving the runtime through its public surface.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;

use agentrun::agent::InMemoryAgentRegistry;
use agentrun::conversation::{ConversationStore, InMemoryConversationStore};
use agentrun::cron::{Cadence, CronRunStatus, NewCronJob};
use agentrun::hooks::{AgentStart, EventKind};
use agentrun::jobs::{BufferedEvent, Job, JobStatus, JobStream};
use agentrun::store::{InMemoryCronStore, InMemoryJobStore};
use agentrun::testing::{StubRunner, test_agents, test_runtime};
use agentrun::{Config, InvokeRequest, Runtime, RuntimeDeps};

async fn collect_job(runtime: &Runtime, id: uuid::Uuid) -> Vec<BufferedEvent> {
    match runtime.stream_job(id).await.unwrap() {
        JobStream::Live(stream) => stream.collect().await,
        JobStream::Snapshot(job) => panic!("expected a live stream, got snapshot {:?}", job.status),
    }
}

fn names(events: &[BufferedEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event.as_str()).collect()
}

#[tokio::test]
async fn submitted_job_streams_to_done() {
    let runner = Arc::new(StubRunner::new().with_tool("search"));
    let runtime = test_runtime(runner.clone());

    let job = runtime
        .submit_job(Job::new("writer", "draft a haiku").with_scope("team-a"))
        .await
        .unwrap();
    let events = collect_job(&runtime, job.id).await;

    let kinds = names(&events);
    assert_eq!(kinds.first(), Some(&"start"));
    assert_eq!(kinds.last(), Some(&"done"));
    assert!(kinds.contains(&"tool:execute"));

    let done = events.last().unwrap().json().unwrap();
    assert_eq!(done["result"], "echo: draft a haiku");
    assert_eq!(done["tools_used"][0], "search");

    // Sequence ids are contiguous from 1.
    let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
    assert_eq!(ids, (1..=events.len() as u64).collect::<Vec<_>>());

    let stored = runtime.get_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(runtime.list_jobs(Some("team-a")).await.unwrap().len(), 1);
    assert!(runtime.list_jobs(Some("team-b")).await.unwrap().is_empty());
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn reconnecting_replays_the_same_log() {
    let runtime = test_runtime(Arc::new(StubRunner::new()));
    let job = runtime.submit_job(Job::new("writer", "hello")).await.unwrap();

    let first = collect_job(&runtime, job.id).await;
    let second = collect_job(&runtime, job.id).await;
    assert_eq!(first, second);
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_running_job_ends_its_stream() {
    let runner = Arc::new(StubRunner::new().with_delay(Duration::from_secs(60)));
    let runtime = test_runtime(runner.clone());

    let job = runtime.submit_job(Job::new("writer", "slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(runtime.get_job(job.id).await.unwrap().status, JobStatus::Running);

    runtime.cancel_job(job.id).await.unwrap();
    let events = collect_job(&runtime, job.id).await;
    assert_eq!(names(&events).last(), Some(&"cancelled"));
    assert_eq!(runtime.get_job(job.id).await.unwrap().status, JobStatus::Cancelled);

    // Cancelling again leaves the terminal record alone.
    let again = runtime.cancel_job(job.id).await.unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn tick_runs_a_due_one_off_cron_job() {
    let runner = Arc::new(StubRunner::new().with_response("digest ready"));
    let runtime = test_runtime(runner.clone());

    let due = Utc::now() - chrono::Duration::minutes(1);
    let cron = runtime
        .crons()
        .create(NewCronJob::new("digest", Cadence::RunAt(due), "writer", "summarize the day"))
        .await
        .unwrap();

    let report = runtime.tick().await;
    assert_eq!(report.executed, 1);
    assert_eq!(report.failed, 0);

    let history = runtime.crons().history(cron.id, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CronRunStatus::Completed);
    assert_eq!(history[0].summary.as_deref(), Some("digest ready"));

    let after = runtime.crons().get(cron.id).await.unwrap();
    assert!(!after.enabled);
    assert!(after.next_run.is_none());

    // Nothing left to run.
    assert_eq!(runtime.tick().await.executed, 0);
    assert_eq!(runner.calls(), 1);
}

#[tokio::test]
async fn secrets_are_scrubbed_before_subscribers_see_them() {
    let runtime = test_runtime(Arc::new(StubRunner::new()));
    let inputs = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&inputs);
    runtime
        .hooks()
        .on::<AgentStart, _>(move |e| seen.lock().unwrap().push(e.input.clone()));

    let secret = "sk-abcdefghijklmnopqrstuvwx";
    let response = runtime
        .invoke(InvokeRequest::new("writer", format!("use key {secret}")))
        .await
        .unwrap();

    // The caller gets the raw response; only observers are scrubbed.
    assert!(response.response.contains(secret));
    let inputs = inputs.lock().unwrap();
    assert_eq!(inputs.len(), 1);
    assert!(!inputs[0].contains(secret));
    assert!(inputs[0].contains("[REDACTED:apiKeys]"));
}

#[tokio::test]
async fn delegation_shows_up_in_the_job_stream() {
    let runner = Arc::new(StubRunner::new().with_delegation("writer", "researcher"));
    let runtime = test_runtime(runner.clone());

    let job = runtime.submit_job(Job::new("writer", "find sources")).await.unwrap();
    let events = collect_job(&runtime, job.id).await;

    let kinds = names(&events);
    assert!(kinds.contains(&"delegate:start"));
    assert!(kinds.contains(&"delegate:end"));
    let done = events.last().unwrap().json().unwrap();
    assert_eq!(done["result"], "researcher said: echo: find sources");
    assert_eq!(runner.calls(), 2);
}

#[tokio::test]
async fn streamed_invoke_ends_with_done() {
    let runtime = Arc::new(test_runtime(Arc::new(StubRunner::new().with_response("ok"))));
    let global = Arc::new(Mutex::new(Vec::new()));
    let g = Arc::clone(&global);
    runtime.hooks().on_any(move |e| g.lock().unwrap().push(e.kind()));

    let events: Vec<BufferedEvent> = runtime
        .invoke_streamed(InvokeRequest::new("writer", "hi"))
        .collect()
        .await;

    assert_eq!(names(&events).first(), Some(&"agent:start"));
    assert_eq!(names(&events).last(), Some(&"done"));
    assert_eq!(events.last().unwrap().json().unwrap()["result"], "ok");
    // Trace-only events reach the stream but not the summary-level hooks.
    assert!(names(&events).contains(&"model:call"));
    assert!(!global.lock().unwrap().contains(&EventKind::ModelCall));
}

#[tokio::test]
async fn long_conversations_compact_automatically() {
    let conversations = Arc::new(InMemoryConversationStore::new());
    let mut config = Config::default();
    config.compaction.auto = true;
    config.compaction.token_limit = 40;
    config.compaction.preserve_tokens = 0;

    let runtime = Runtime::new(
        RuntimeDeps {
            agents: Arc::new(InMemoryAgentRegistry::with_agents(test_agents())),
            runner: Arc::new(StubRunner::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            crons: Arc::new(InMemoryCronStore::new()),
            conversations: conversations.clone(),
        },
        config,
    );

    runtime
        .invoke(InvokeRequest::new("writer", "x".repeat(200)).with_conversation("conv-1"))
        .await
        .unwrap();

    let messages = conversations.get("conv-1").await.unwrap().unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].is_summary());
}
