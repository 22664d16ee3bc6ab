//! Per-request delegation context.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::runner::AgentRunResponse;
use crate::error::Error;
use crate::hooks::{EventScope, HookEmitter, ToolExecute};

/// Context threaded through one top-level request and every agent it
/// delegates to.
///
/// Created once per inbound request with [`root`](Self::root). Each
/// delegation hop gets a [`child`](Self::child) with one more level of
/// depth; the event bus and cancellation token are shared by the whole
/// call tree.
#[derive(Clone)]
pub struct DelegationContext {
    /// Agents already on the call path, outermost first.
    pub chain: Vec<String>,
    /// Number of delegation hops below the entry agent.
    pub depth: usize,
    /// Per-request event bus.
    pub bus: Arc<HookEmitter>,
    /// The entry agent.
    pub orchestrator: String,
    pub cancel: CancellationToken,
    pub conversation_id: Option<String>,
    pub scope_id: Option<String>,
    pub job_id: Option<Uuid>,
}

impl DelegationContext {
    pub fn root(
        orchestrator: impl Into<String>,
        bus: Arc<HookEmitter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain: Vec::new(),
            depth: 0,
            bus,
            orchestrator: orchestrator.into(),
            cancel,
            conversation_id: None,
            scope_id: None,
            job_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_scope(mut self, scope_id: Option<String>) -> Self {
        self.scope_id = scope_id;
        self
    }

    pub fn with_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    /// Context for a call made by `current_agent` to another agent.
    pub fn child(&self, current_agent: impl Into<String>) -> Self {
        let mut chain = self.chain.clone();
        chain.push(current_agent.into());
        Self {
            chain,
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Event scope for events about `agent_name` within this request.
    pub fn scope(&self, agent_name: &str) -> EventScope {
        EventScope {
            agent_name: agent_name.to_string(),
            conversation_id: self.conversation_id.clone(),
            scope_id: self.scope_id.clone(),
            job_id: self.job_id,
        }
    }

    /// Report a finished tool call on the request's bus.
    pub fn emit_tool(
        &self,
        agent_name: &str,
        tool: &str,
        input: serde_json::Value,
        output: Option<String>,
        started: Instant,
    ) {
        self.bus.emit(ToolExecute {
            timestamp: Utc::now(),
            scope: self.scope(agent_name),
            tool: tool.to_string(),
            input,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }
}

impl std::fmt::Debug for DelegationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelegationContext")
            .field("chain", &self.chain)
            .field("depth", &self.depth)
            .field("orchestrator", &self.orchestrator)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("conversation_id", &self.conversation_id)
            .field("scope_id", &self.scope_id)
            .field("job_id", &self.job_id)
            .finish()
    }
}

/// Agent-to-agent calls, handed to the runner so its tools can delegate.
#[async_trait]
pub trait Delegate: Send + Sync {
    /// Run `to` with `input` on behalf of `from`.
    async fn delegate(
        &self,
        ctx: &DelegationContext,
        from: &str,
        to: &str,
        input: &str,
    ) -> Result<AgentRunResponse, Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_grows_chain_and_depth() {
        let cancel = CancellationToken::new();
        let root = DelegationContext::root("planner", Arc::new(HookEmitter::default()), cancel.clone())
            .with_scope(Some("tenant".to_string()));
        assert_eq!(root.depth, 0);
        assert!(root.chain.is_empty());

        let child = root.child("planner");
        let grandchild = child.child("researcher");
        assert_eq!(grandchild.depth, 2);
        assert_eq!(grandchild.chain, vec!["planner", "researcher"]);
        assert_eq!(grandchild.orchestrator, "planner");
        assert_eq!(grandchild.scope_id.as_deref(), Some("tenant"));
        assert!(Arc::ptr_eq(&root.bus, &grandchild.bus));

        // Parent is untouched.
        assert_eq!(root.depth, 0);

        cancel.cancel();
        assert!(grandchild.is_cancelled());
    }
}
