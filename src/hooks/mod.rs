//! Lifecycle hooks for observing agent execution.
//!
//! Every execution path reports through a closed set of events:
//!
//! - **agent:start / agent:end / agent:error**: one agent run
//! - **job:start / job:end / job:cancelled**: one background job
//! - **cron:executed**: one scheduled run
//! - **tool:execute, delegate:start / delegate:end, model:call**: trace detail
//!
//! Subscribers register on a [`HookEmitter`] either per event type
//! (`on::<AgentEnd, _>`) or for everything (`on_any`). Trace events are
//! only delivered when the emitter runs at [`HookLevel::Trace`].
//! [`RedactingEmitter`] scrubs secrets before events reach subscribers.

mod emitter;
mod event;
mod redact;

pub use emitter::{EventSink, HookEmitter, HookLevel, HookSubscription};
pub use event::{
    AgentEnd, AgentError, AgentStart, CronExecuted, DelegateEnd, DelegateStart, EventKind,
    EventScope, HookPayload, JobCancelled, JobEnd, JobStart, LifecycleEvent, ModelCall,
    ToolExecute,
};
pub use redact::{
    BuiltinPattern, RedactingEmitter, RedactionPattern, RedactionSettings, redact_str, redact_value,
};
