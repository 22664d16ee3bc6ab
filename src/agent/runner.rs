//! The agent-run collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::ToolSpec;
use crate::agent::delegation::{Delegate, DelegationContext};
use crate::conversation::Message;
use crate::error::LlmError;
use crate::llm::Usage;

/// Everything a runner needs for one agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRunRequest {
    pub agent_name: String,
    pub system: String,
    pub tools: Vec<ToolSpec>,
    pub input: String,
    /// Model override; `None` means the runner's default.
    pub model: Option<String>,
    /// Prior conversation, oldest first.
    pub history: Vec<Message>,
}

/// Outcome of one agent turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentRunResponse {
    pub response: String,
    pub usage: Usage,
    /// Tool names invoked, in call order.
    pub tools_used: Vec<String>,
}

/// Runs an agent: the model call plus its tool loop.
///
/// Implementations should observe `ctx.cancel` where they can, report tool
/// calls on `ctx.bus`, and route agent-to-agent calls through `delegate`.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        ctx: &DelegationContext,
        request: AgentRunRequest,
        delegate: &dyn Delegate,
    ) -> Result<AgentRunResponse, LlmError>;
}
