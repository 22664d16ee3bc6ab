//! The converged agent-run path.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;

use crate::agent::delegation::{Delegate, DelegationContext};
use crate::agent::runner::{AgentRunRequest, AgentRunResponse, AgentRunner};
use crate::agent::AgentRegistry;
use crate::conversation::Message;
use crate::error::{AgentError, Error};
use crate::hooks::{AgentEnd, AgentStart, DelegateEnd, DelegateStart, ModelCall};
use crate::llm::{ResilienceConfig, with_resilience_until};

/// One request to run an agent.
#[derive(Debug, Clone, Default)]
pub struct AgentInvocation {
    pub agent_name: String,
    pub input: String,
    /// Replaces the agent's default system prompt.
    pub system_override: Option<String>,
    pub model: Option<String>,
    pub history: Vec<Message>,
}

impl AgentInvocation {
    pub fn new(agent_name: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            input: input.into(),
            ..Self::default()
        }
    }

    pub fn with_system(mut self, system: Option<String>) -> Self {
        self.system_override = system;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }
}

/// Runs agents for every request path and for delegation hops.
pub struct AgentService {
    registry: Arc<dyn AgentRegistry>,
    runner: Arc<dyn AgentRunner>,
    resilience: ResilienceConfig,
    max_delegation_depth: usize,
}

impl AgentService {
    pub fn new(
        registry: Arc<dyn AgentRegistry>,
        runner: Arc<dyn AgentRunner>,
        resilience: ResilienceConfig,
        max_delegation_depth: usize,
    ) -> Self {
        Self {
            registry,
            runner,
            resilience,
            max_delegation_depth,
        }
    }

    pub fn registry(&self) -> &Arc<dyn AgentRegistry> {
        &self.registry
    }

    pub fn runner(&self) -> &Arc<dyn AgentRunner> {
        &self.runner
    }

    pub fn resilience(&self) -> &ResilienceConfig {
        &self.resilience
    }

    pub fn max_delegation_depth(&self) -> usize {
        self.max_delegation_depth
    }

    /// Run one agent.
    ///
    /// Emits `agent:start`, `model:call` and `agent:end` on the request bus.
    /// Failures are returned, not reported: callers decide whether a
    /// failure becomes `agent:error`, a failed job or a failed delegation.
    pub async fn run_agent(
        &self,
        ctx: &DelegationContext,
        invocation: AgentInvocation,
    ) -> Result<AgentRunResponse, Error> {
        if ctx.is_cancelled() {
            return Err(AgentError::Cancelled.into());
        }

        let agent = self
            .registry
            .get(&invocation.agent_name)
            .await
            .ok_or_else(|| AgentError::NotFound {
                name: invocation.agent_name.clone(),
            })?;

        let scope = ctx.scope(&agent.name);
        let request = AgentRunRequest {
            agent_name: agent.name.clone(),
            system: invocation
                .system_override
                .unwrap_or_else(|| agent.default_system.clone()),
            tools: agent.tools.clone(),
            input: invocation.input,
            model: invocation.model,
            history: invocation.history,
        };

        ctx.bus.emit(AgentStart {
            timestamp: Utc::now(),
            scope: scope.clone(),
            input: request.input.clone(),
            model: request.model.clone(),
        });

        let started = Instant::now();
        let result = with_resilience_until(
            &self.resilience,
            request.model.as_deref(),
            &ctx.cancel,
            |fallback| {
                let mut request = request.clone();
                if fallback.is_some() {
                    request.model = fallback;
                }
                async move { self.runner.run(ctx, request, self).await }
            },
        )
        .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        ctx.bus.emit(ModelCall {
            timestamp: Utc::now(),
            scope: scope.clone(),
            model: request.model.clone(),
            usage: result.as_ref().map(|r| r.usage).unwrap_or_default(),
            duration_ms,
            success: result.is_ok(),
        });

        let response = result?;
        ctx.bus.emit(AgentEnd {
            timestamp: Utc::now(),
            scope,
            response: response.response.clone(),
            usage: response.usage,
            tools_used: response.tools_used.clone(),
            duration_ms,
        });

        tracing::debug!(
            agent = %agent.name,
            depth = ctx.depth,
            duration_ms,
            total_tokens = response.usage.total_tokens,
            "Agent run finished"
        );
        Ok(response)
    }
}

#[async_trait]
impl Delegate for AgentService {
    async fn delegate(
        &self,
        ctx: &DelegationContext,
        from: &str,
        to: &str,
        input: &str,
    ) -> Result<AgentRunResponse, Error> {
        let child = ctx.child(from);
        if child.depth > self.max_delegation_depth {
            tracing::warn!(
                from,
                to,
                depth = child.depth,
                max = self.max_delegation_depth,
                "Delegation depth exceeded"
            );
            return Err(AgentError::DepthExceeded {
                depth: child.depth,
                max: self.max_delegation_depth,
                chain: child.chain,
            }
            .into());
        }

        ctx.bus.emit(DelegateStart {
            timestamp: Utc::now(),
            scope: ctx.scope(from),
            from: from.to_string(),
            to: to.to_string(),
            depth: child.depth,
            input: input.to_string(),
        });

        let started = Instant::now();
        let result = self
            .run_agent(&child, AgentInvocation::new(to, input))
            .await;

        ctx.bus.emit(DelegateEnd {
            timestamp: Utc::now(),
            scope: ctx.scope(from),
            from: from.to_string(),
            to: to.to_string(),
            depth: child.depth,
            duration_ms: started.elapsed().as_millis() as u64,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
        });
        result
    }
}
