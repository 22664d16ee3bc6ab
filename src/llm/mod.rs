//! Model-call plumbing shared by every execution path.
//!
//! The concrete provider lives behind [`crate::agent::AgentRunner`]; this
//! module owns what wraps it: token usage accounting and the retry /
//! fallback executor.

mod resilience;

pub use resilience::{
    FallbackContext, FallbackHandler, ResilienceConfig, backoff_delay, is_retryable,
    static_fallback, with_resilience, with_resilience_until,
};

use serde::{Deserialize, Serialize};

/// Token usage reported by one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl std::ops::AddAssign for Usage {
    fn add_assign(&mut self, other: Self) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}
