//! Error types for agentrun.

use uuid::Uuid;

/// Top-level error type for the runtime.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cron error: {0}")]
    Cron(#[from] CronError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Whether this error is a cancellation rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Error::Agent(AgentError::Cancelled) | Error::Llm(LlmError::Cancelled)
        )
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Cron expression and cron job errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("Cron expression must have 5 fields, found {found}")]
    FieldCount { found: usize },

    #[error("Invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("No next run for '{expr}' within one year")]
    NoNextRun { expr: String },

    #[error("Cron job {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid cron job: {reason}")]
    InvalidJob { reason: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },
}

/// Agent lookup and delegation errors.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {name} not found")]
    NotFound { name: String },

    #[error("Delegation depth {depth} exceeds maximum of {max} (chain: {})", chain.join(" -> "))]
    DepthExceeded {
        depth: usize,
        max: usize,
        chain: Vec<String>,
    },

    #[error("Agent run was cancelled")]
    Cancelled,
}

/// Errors from the agent-run / model collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LlmError {
    #[error("Provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Request timeout: {reason}")]
    Timeout { reason: String },

    #[error("Invalid response: {reason}")]
    InvalidResponse { reason: String },

    #[error("Request was cancelled")]
    Cancelled,
}

impl LlmError {
    /// HTTP status code carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            LlmError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Storage collaborator errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Entity already exists: {entity} with id {id}")]
    Conflict { entity: String, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, Error>;
