//! Test harness for driving the runtime without a model provider.
//!
//! Provides:
//! - [`StubRunner`]: a scripted [`AgentRunner`] with call recording
//! - [`test_runtime`]: a [`Runtime`] wired to in-memory stores
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentrun::testing::{StubRunner, test_runtime};
//!
//! # async fn demo() {
//! let runner = Arc::new(StubRunner::new().with_response("hello"));
//! let runtime = test_runtime(runner.clone());
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::agent::{
    AgentDefinition, AgentRunRequest, AgentRunResponse, AgentRunner, Delegate, DelegationContext,
    InMemoryAgentRegistry,
};
use crate::config::Config;
use crate::conversation::InMemoryConversationStore;
use crate::error::LlmError;
use crate::llm::{ResilienceConfig, Usage};
use crate::runtime::{Runtime, RuntimeDeps};
use crate::store::{InMemoryCronStore, InMemoryJobStore};

/// A scripted agent-run collaborator for tests.
///
/// Supports:
/// - Fixed response content, or `echo: <input>` by default
/// - Scripted one-shot errors via [`push_error()`](Self::push_error)
/// - Delegation from one agent to another via [`with_delegation()`](Self::with_delegation)
/// - Tool reporting, artificial latency and mid-call cancellation
/// - Call counting via [`calls()`](Self::calls) and request capture via
///   [`requests()`](Self::requests)
#[derive(Default)]
pub struct StubRunner {
    response: Option<String>,
    script: Mutex<VecDeque<LlmError>>,
    delegations: HashMap<String, String>,
    tools: Vec<String>,
    delay: Option<Duration>,
    cancel_during_run: bool,
    call_count: AtomicU32,
    requests: Mutex<Vec<AgentRunRequest>>,
}

impl StubRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Always answer with `response`.
    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// When running `agent`, delegate its input to `to` first.
    ///
    /// The response becomes `<to> said: <reply>`, or
    /// `delegation failed: <error>` when the hop fails.
    pub fn with_delegation(mut self, agent: impl Into<String>, to: impl Into<String>) -> Self {
        self.delegations.insert(agent.into(), to.into());
        self
    }

    /// Report a call to `tool` on every run.
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    /// Take `delay` per call. Cancellation interrupts the wait.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Cancel the request's token while the call is in flight, then finish
    /// normally.
    pub fn cancel_during_run(mut self) -> Self {
        self.cancel_during_run = true;
        self
    }

    /// Fail the next call with `error`. Errors are consumed in push order.
    pub fn push_error(&self, error: LlmError) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(error);
    }

    /// Number of times `run` was called.
    pub fn calls(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<AgentRunRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AgentRunner for StubRunner {
    async fn run(
        &self,
        ctx: &DelegationContext,
        request: AgentRunRequest,
        delegate: &dyn Delegate,
    ) -> Result<AgentRunResponse, LlmError> {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        if self.cancel_during_run {
            ctx.cancel.cancel();
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(LlmError::Cancelled),
            }
        }

        let scripted = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(error) = scripted {
            return Err(error);
        }

        let mut tools_used = Vec::new();
        for tool in &self.tools {
            let started = Instant::now();
            ctx.emit_tool(
                &request.agent_name,
                tool,
                serde_json::json!({ "input": request.input }),
                Some("ok".to_string()),
                started,
            );
            tools_used.push(tool.clone());
        }

        let response = match self.delegations.get(&request.agent_name) {
            Some(to) => {
                match delegate
                    .delegate(ctx, &request.agent_name, to, &request.input)
                    .await
                {
                    Ok(reply) => format!("{to} said: {}", reply.response),
                    Err(e) => format!("delegation failed: {e}"),
                }
            }
            None => self
                .response
                .clone()
                .unwrap_or_else(|| format!("echo: {}", request.input)),
        };

        Ok(AgentRunResponse {
            response,
            usage: Usage::new(10, 5),
            tools_used,
        })
    }
}

/// Agents registered by [`test_runtime`].
pub fn test_agents() -> Vec<AgentDefinition> {
    vec![
        AgentDefinition::new("writer", "You write concise prose.")
            .with_description("Drafts text"),
        AgentDefinition::new("researcher", "You research topics.")
            .with_description("Looks things up"),
    ]
}

/// A runtime on in-memory stores with the [`test_agents`] registered.
///
/// Retries use a short fixed delay so failing calls do not slow tests down.
pub fn test_runtime(runner: Arc<StubRunner>) -> Runtime {
    let mut config = Config::default();
    config.resilience = ResilienceConfig {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter: 0.0,
        ..ResilienceConfig::default()
    };

    Runtime::new(
        RuntimeDeps {
            agents: Arc::new(InMemoryAgentRegistry::with_agents(test_agents())),
            runner,
            jobs: Arc::new(InMemoryJobStore::new()),
            crons: Arc::new(InMemoryCronStore::new()),
            conversations: Arc::new(InMemoryConversationStore::new()),
        },
        config,
    )
}
