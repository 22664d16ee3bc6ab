//! Agents and the single path every agent run goes through.
//!
//! An agent is a named bundle of a system prompt and a tool set. Running
//! one is delegated to an [`AgentRunner`] (the model provider plus tool
//! loop, which lives outside this crate). [`AgentService`] wraps that call
//! with registry lookup, retries, lifecycle events and delegation depth
//! limits, and is shared by synchronous, streamed, job and cron requests.

mod delegation;
mod runner;
mod service;

pub use delegation::{Delegate, DelegationContext};
pub use runner::{AgentRunRequest, AgentRunResponse, AgentRunner};
pub use service::{AgentInvocation, AgentService};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// A tool an agent may call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

/// A registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    pub description: String,
    pub default_system: String,
    pub tools: Vec<ToolSpec>,
    /// Extra named actions the agent exposes.
    #[serde(default)]
    pub actions: Vec<String>,
}

impl AgentDefinition {
    pub fn new(name: impl Into<String>, default_system: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            default_system: default_system.into(),
            tools: Vec::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }
}

/// Lookup of agents by name.
#[async_trait]
pub trait AgentRegistry: Send + Sync {
    async fn get(&self, name: &str) -> Option<AgentDefinition>;

    async fn list(&self) -> Vec<AgentDefinition>;
}

/// Registry held in memory.
#[derive(Default)]
pub struct InMemoryAgentRegistry {
    agents: RwLock<HashMap<String, AgentDefinition>>,
}

impl InMemoryAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a fixed set of agents.
    pub fn with_agents(agents: impl IntoIterator<Item = AgentDefinition>) -> Self {
        Self {
            agents: RwLock::new(
                agents
                    .into_iter()
                    .map(|agent| (agent.name.clone(), agent))
                    .collect(),
            ),
        }
    }

    /// Add or replace an agent.
    pub async fn register(&self, agent: AgentDefinition) {
        tracing::debug!(agent = %agent.name, tools = agent.tools.len(), "Registered agent");
        self.agents.write().await.insert(agent.name.clone(), agent);
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.agents.write().await.remove(name).is_some()
    }
}

#[async_trait]
impl AgentRegistry for InMemoryAgentRegistry {
    async fn get(&self, name: &str) -> Option<AgentDefinition> {
        self.agents.read().await.get(name).cloned()
    }

    async fn list(&self) -> Vec<AgentDefinition> {
        let mut agents: Vec<_> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = InMemoryAgentRegistry::with_agents([AgentDefinition::new("writer", "Write.")]);
        assert!(registry.get("writer").await.is_some());
        assert!(registry.get("reader").await.is_none());

        registry
            .register(AgentDefinition::new("reader", "Read.").with_description("reads"))
            .await;
        let names: Vec<String> = registry.list().await.into_iter().map(|a| a.name).collect();
        assert_eq!(names, vec!["reader", "writer"]);

        assert!(registry.unregister("writer").await);
        assert!(registry.get("writer").await.is_none());
    }
}
