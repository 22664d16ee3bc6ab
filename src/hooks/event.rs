//! Lifecycle event payloads.
//!
//! The set of events is closed: every shape is a struct here and a variant
//! of [`LifecycleEvent`]. Serialized events carry a `type` tag such as
//! `"agent:start"`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::Usage;

/// Identifiers that place an event within a request, job or tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventScope {
    pub agent_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
}

impl EventScope {
    pub fn agent(name: impl Into<String>) -> Self {
        Self {
            agent_name: name.into(),
            ..Self::default()
        }
    }

    /// The same scope attributed to another agent.
    pub fn for_agent(&self, name: impl Into<String>) -> Self {
        Self {
            agent_name: name.into(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStart {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEnd {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub response: String,
    pub usage: Usage,
    pub tools_used: Vec<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentError {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStart {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnd {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub result: String,
    pub usage: Usage,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCancelled {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronExecuted {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub cron_id: Uuid,
    /// The run's history record; also keys its event buffer.
    pub execution_id: Uuid,
    pub cron_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecute {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub tool: String,
    pub input: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateStart {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub from: String,
    pub to: String,
    pub depth: usize,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateEnd {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    pub from: String,
    pub to: String,
    pub depth: usize,
    pub duration_ms: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCall {
    pub timestamp: DateTime<Utc>,
    pub scope: EventScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub usage: Usage,
    pub duration_ms: u64,
    pub success: bool,
}

/// Discriminant of a [`LifecycleEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AgentStart,
    AgentEnd,
    AgentError,
    JobStart,
    JobEnd,
    JobCancelled,
    CronExecuted,
    ToolExecute,
    DelegateStart,
    DelegateEnd,
    ModelCall,
}

impl EventKind {
    /// Wire name, e.g. `"agent:start"`.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::AgentStart => "agent:start",
            EventKind::AgentEnd => "agent:end",
            EventKind::AgentError => "agent:error",
            EventKind::JobStart => "job:start",
            EventKind::JobEnd => "job:end",
            EventKind::JobCancelled => "job:cancelled",
            EventKind::CronExecuted => "cron:executed",
            EventKind::ToolExecute => "tool:execute",
            EventKind::DelegateStart => "delegate:start",
            EventKind::DelegateEnd => "delegate:end",
            EventKind::ModelCall => "model:call",
        }
    }

    /// Trace events are only delivered at [`HookLevel::Trace`](super::HookLevel::Trace).
    pub fn is_trace(self) -> bool {
        matches!(
            self,
            EventKind::ToolExecute
                | EventKind::DelegateStart
                | EventKind::DelegateEnd
                | EventKind::ModelCall
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A payload type that can be subscribed to with [`HookEmitter::on`](super::HookEmitter::on).
pub trait HookPayload: Into<LifecycleEvent> + Send + Sync + 'static {
    const KIND: EventKind;

    fn from_event(event: &LifecycleEvent) -> Option<&Self>;
}

macro_rules! lifecycle_events {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// One lifecycle event.
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        #[serde(tag = "type")]
        pub enum LifecycleEvent {
            $(
                #[serde(rename = $name)]
                $variant($variant),
            )+
        }

        impl LifecycleEvent {
            pub fn kind(&self) -> EventKind {
                match self {
                    $(LifecycleEvent::$variant(_) => EventKind::$variant,)+
                }
            }

            pub fn scope(&self) -> &EventScope {
                match self {
                    $(LifecycleEvent::$variant(e) => &e.scope,)+
                }
            }

            pub fn timestamp(&self) -> DateTime<Utc> {
                match self {
                    $(LifecycleEvent::$variant(e) => e.timestamp,)+
                }
            }
        }

        $(
            impl From<$variant> for LifecycleEvent {
                fn from(payload: $variant) -> Self {
                    LifecycleEvent::$variant(payload)
                }
            }

            impl HookPayload for $variant {
                const KIND: EventKind = EventKind::$variant;

                fn from_event(event: &LifecycleEvent) -> Option<&Self> {
                    match event {
                        LifecycleEvent::$variant(payload) => Some(payload),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }
        )+
    };
}

lifecycle_events! {
    AgentStart => "agent:start",
    AgentEnd => "agent:end",
    AgentError => "agent:error",
    JobStart => "job:start",
    JobEnd => "job:end",
    JobCancelled => "job:cancelled",
    CronExecuted => "cron:executed",
    ToolExecute => "tool:execute",
    DelegateStart => "delegate:start",
    DelegateEnd => "delegate:end",
    ModelCall => "model:call",
}
