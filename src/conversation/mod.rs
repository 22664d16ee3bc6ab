//! Conversation history and its compaction.

mod compaction;
mod store;
mod tokens;

pub use compaction::{CompactionOptions, CompactionResult, Compactor, DEFAULT_COMPACTION_PROMPT};
pub use store::{ConversationStore, InMemoryConversationStore};
pub use tokens::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens};

use serde::{Deserialize, Serialize};

/// Message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
        }
    }
}

/// Marks a message as a compaction summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionMarker {
    /// How many messages the summary replaced.
    pub summarized_count: usize,
}

/// One conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction: Option<CompactionMarker>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            compaction: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            compaction: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            compaction: None,
        }
    }

    /// An assistant message holding a compaction summary.
    pub fn summary(content: impl Into<String>, summarized_count: usize) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            compaction: Some(CompactionMarker { summarized_count }),
        }
    }

    pub fn is_summary(&self) -> bool {
        self.compaction.is_some()
    }
}
