//! agentrun: an agent task execution runtime.
//!
//! Runs named agents (a system prompt plus a tool set) four ways:
//! synchronously, as a streamed response, as a detached background job, or
//! on a cron schedule.
//!
//! # Architecture
//!
//! ```text
//!   invoke / invoke_streamed      submit_job            tick / interval
//!            │                        │                        │
//!            │                 ┌──────▼──────┐         ┌───────▼───────┐
//!            │                 │ JobExecutor │         │ CronDispatcher│
//!            │                 │ + EventBuf  │         │ + history     │
//!            │                 └──────┬──────┘         └───────┬───────┘
//!            └───────────────┬────────┴────────────────────────┘
//!                            ▼
//!                 ┌─────────────────────┐   delegate   ┌──────────────┐
//!                 │ AgentService        │◀────────────▶│ AgentRunner  │
//!                 │ resilience + hooks  │──────────────▶│ (model+tools)│
//!                 └──────────┬──────────┘              └──────────────┘
//!                            ▼
//!                 HookEmitter ◀── RedactingEmitter ◀── per-request bus
//! ```
//!
//! # Features
//!
//! - **Background jobs** with cooperative cancellation and reconnectable
//!   event streams
//! - **Cron schedules**, recurring or one-off, with execution history
//! - **Delegation** between agents under a depth limit
//! - **Resilient model calls**: retry with backoff and jitter, then fallback
//! - **Conversation compaction** with overflow recovery
//! - **Lifecycle hooks** with secret redaction

pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod cron;
pub mod error;
pub mod hooks;
pub mod jobs;
pub mod llm;
pub mod runtime;
pub mod store;
pub mod testing;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::{InvokeRequest, Runtime, RuntimeDeps};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::agent::{
        AgentDefinition, AgentRegistry, AgentRunRequest, AgentRunResponse, AgentRunner,
        Delegate, DelegationContext,
    };
    pub use crate::config::Config;
    pub use crate::cron::{Cadence, CronJob, NewCronJob};
    pub use crate::error::{Error, Result};
    pub use crate::hooks::{HookEmitter, HookLevel, LifecycleEvent};
    pub use crate::jobs::{Job, JobStatus, JobStream};
    pub use crate::runtime::{InvokeRequest, Runtime, RuntimeDeps};
}
