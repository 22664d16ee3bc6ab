//! Conversation storage boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::conversation::Message;
use crate::error::StoreError;

/// Persistence for conversation histories.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Messages oldest first, or `None` if the conversation does not exist.
    async fn get(&self, conversation_id: &str) -> Result<Option<Vec<Message>>, StoreError>;

    /// Append messages, creating the conversation if needed.
    async fn append(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StoreError>;

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError>;

    /// Replace the whole history.
    ///
    /// Backends that can do this in one write should override it; the
    /// default clears and appends.
    async fn replace(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.clear(conversation_id).await?;
        self.append(conversation_id, messages).await
    }

    /// Replace the oldest `prefix_len` messages with `messages`, keeping
    /// anything appended after them.
    ///
    /// Fails with [`StoreError::Conflict`] if the history is now shorter
    /// than `prefix_len`. The default reads then replaces; backends that
    /// can do it in one write should override it.
    async fn replace_prefix(
        &self,
        conversation_id: &str,
        prefix_len: usize,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let current = self.get(conversation_id).await?.unwrap_or_default();
        let rewritten = splice_prefix(conversation_id, &current, prefix_len, messages)?;
        self.replace(conversation_id, &rewritten).await
    }
}

fn splice_prefix(
    conversation_id: &str,
    current: &[Message],
    prefix_len: usize,
    messages: &[Message],
) -> Result<Vec<Message>, StoreError> {
    let Some(tail) = current.get(prefix_len..) else {
        return Err(StoreError::Conflict {
            entity: "conversation".to_string(),
            id: conversation_id.to_string(),
        });
    };
    let mut rewritten = Vec::with_capacity(messages.len() + tail.len());
    rewritten.extend_from_slice(messages);
    rewritten.extend_from_slice(tail);
    Ok(rewritten)
}

/// Conversation store held in memory.
#[derive(Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get(&self, conversation_id: &str) -> Result<Option<Vec<Message>>, StoreError> {
        Ok(self.conversations.read().await.get(conversation_id).cloned())
    }

    async fn append(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .entry(conversation_id.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn clear(&self, conversation_id: &str) -> Result<(), StoreError> {
        self.conversations.write().await.remove(conversation_id);
        Ok(())
    }

    async fn replace(&self, conversation_id: &str, messages: &[Message]) -> Result<(), StoreError> {
        self.conversations
            .write()
            .await
            .insert(conversation_id.to_string(), messages.to_vec());
        Ok(())
    }

    async fn replace_prefix(
        &self,
        conversation_id: &str,
        prefix_len: usize,
        messages: &[Message],
    ) -> Result<(), StoreError> {
        let mut conversations = self.conversations.write().await;
        let current = conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let rewritten = splice_prefix(conversation_id, current, prefix_len, messages)?;
        conversations.insert(conversation_id.to_string(), rewritten);
        Ok(())
    }
}
