//! Conversation compaction.
//!
//! When a conversation grows past its token budget, compaction:
//! 1. Keeps the newest messages that fit in `preserve_tokens`
//! 2. Summarizes everything older through the model
//! 3. Evicts preserved messages, then truncates the summary, until the
//!    result fits in `token_limit`
//! 4. Rewrites the compacted prefix of the stored history as the summary
//!    followed by the survivors, keeping messages appended meanwhile

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunRequest, AgentRunResponse, AgentRunner, Delegate, DelegationContext};
use crate::conversation::store::ConversationStore;
use crate::conversation::tokens::{estimate_messages_tokens, estimate_tokens};
use crate::conversation::{Message, estimate_message_tokens};
use crate::error::{AgentError, Error};
use crate::hooks::HookEmitter;
use crate::llm::{ResilienceConfig, with_resilience};

pub const DEFAULT_COMPACTION_PROMPT: &str = r#"Summarize the following conversation concisely. Focus on:
- Key decisions made
- Important information exchanged
- Actions taken
- Outcomes achieved

Earlier summaries are marked [Previous Summary]; fold them into the new summary.
Be brief but capture all important details. Use bullet points."#;

const SUMMARIZER_AGENT: &str = "compactor";

/// Knobs for one compaction.
#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Token budget kept verbatim from the newest messages.
    pub preserve_tokens: usize,
    /// Upper bound for the rewritten history.
    pub token_limit: usize,
    /// Summarization instructions; [`DEFAULT_COMPACTION_PROMPT`] if `None`.
    pub prompt: Option<String>,
    pub model: Option<String>,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            preserve_tokens: 8_000,
            token_limit: 80_000,
            prompt: None,
            model: None,
        }
    }
}

/// Result of a compaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    /// The summary written, `None` when nothing needed summarizing.
    pub summary: Option<String>,
    /// Messages folded into the summary.
    pub summarized_count: usize,
    /// Preserved messages evicted to fit the token limit.
    pub dropped_count: usize,
    /// Messages kept verbatim.
    pub preserved_count: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
}

/// Compacts stored conversations.
pub struct Compactor {
    store: Arc<dyn ConversationStore>,
    runner: Arc<dyn AgentRunner>,
    resilience: ResilienceConfig,
    bus: Arc<HookEmitter>,
}

impl Compactor {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        runner: Arc<dyn AgentRunner>,
        resilience: ResilienceConfig,
        bus: Arc<HookEmitter>,
    ) -> Self {
        Self {
            store,
            runner,
            resilience,
            bus,
        }
    }

    /// Whether `messages` exceed `token_limit`.
    pub fn needs_compaction(messages: &[Message], token_limit: usize) -> bool {
        estimate_messages_tokens(messages) > token_limit
    }

    /// Compact one conversation.
    ///
    /// Returns `None` when the conversation does not exist or is empty.
    pub async fn compact(
        &self,
        conversation_id: &str,
        options: CompactionOptions,
    ) -> Result<Option<CompactionResult>, Error> {
        let messages = match self.store.get(conversation_id).await? {
            Some(messages) if !messages.is_empty() => messages,
            _ => return Ok(None),
        };
        let tokens_before = estimate_messages_tokens(&messages);

        let split = split_point(&messages, options.preserve_tokens);
        let (to_summarize, preserved) = messages.split_at(split);

        if to_summarize.is_empty() {
            return Ok(Some(CompactionResult {
                summary: None,
                summarized_count: 0,
                dropped_count: 0,
                preserved_count: preserved.len(),
                tokens_before,
                tokens_after: tokens_before,
            }));
        }

        let prompt = options
            .prompt
            .as_deref()
            .unwrap_or(DEFAULT_COMPACTION_PROMPT);
        let summary = self
            .summarize(conversation_id, prompt, to_summarize, options.model.as_deref())
            .await?;

        let (summary, preserved, dropped_count) =
            fit_to_limit(summary, preserved.to_vec(), options.token_limit);

        let mut rewritten = Vec::with_capacity(preserved.len() + 1);
        rewritten.push(Message::summary(summary.clone(), to_summarize.len()));
        rewritten.extend(preserved);
        // Messages appended while the summary was being written stay after it.
        self.store
            .replace_prefix(conversation_id, messages.len(), &rewritten)
            .await?;

        let result = CompactionResult {
            summary: Some(summary),
            summarized_count: to_summarize.len(),
            dropped_count,
            preserved_count: rewritten.len() - 1,
            tokens_before,
            tokens_after: estimate_messages_tokens(&rewritten),
        };
        tracing::info!(
            conversation_id,
            summarized = result.summarized_count,
            dropped = result.dropped_count,
            tokens_before = result.tokens_before,
            tokens_after = result.tokens_after,
            "Compacted conversation"
        );
        Ok(Some(result))
    }

    async fn summarize(
        &self,
        conversation_id: &str,
        prompt: &str,
        messages: &[Message],
        model: Option<&str>,
    ) -> Result<String, Error> {
        let ctx = DelegationContext::root(
            SUMMARIZER_AGENT,
            Arc::clone(&self.bus),
            CancellationToken::new(),
        )
        .with_conversation(Some(conversation_id.to_string()));
        let request = AgentRunRequest {
            agent_name: SUMMARIZER_AGENT.to_string(),
            system: prompt.to_string(),
            tools: Vec::new(),
            input: format_transcript(messages),
            model: model.map(String::from),
            history: Vec::new(),
        };

        let response = with_resilience(&self.resilience, model, |fallback| {
            let mut request = request.clone();
            if fallback.is_some() {
                request.model = fallback;
            }
            let ctx = &ctx;
            async move { self.runner.run(ctx, request, &NoDelegation).await }
        })
        .await?;
        Ok(response.response)
    }
}

/// Index of the oldest message in the newest run that fits in `preserve_tokens`.
fn split_point(messages: &[Message], preserve_tokens: usize) -> usize {
    let mut used = 0;
    let mut split = messages.len();
    for (index, message) in messages.iter().enumerate().rev() {
        let tokens = estimate_message_tokens(message);
        if used + tokens > preserve_tokens {
            break;
        }
        used += tokens;
        split = index;
    }
    split
}

fn format_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|message| {
            if message.is_summary() {
                format!("[Previous Summary]: {}", message.content)
            } else {
                format!("{}: {}", message.role, message.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Evict the oldest preserved messages while more than one remains, then
/// truncate the summary, until everything fits in `token_limit`.
fn fit_to_limit(
    summary: String,
    mut preserved: Vec<Message>,
    token_limit: usize,
) -> (String, Vec<Message>, usize) {
    let summary_tokens = estimate_tokens(&summary);
    let mut preserved_tokens = estimate_messages_tokens(&preserved);
    let mut dropped = 0;

    while summary_tokens + preserved_tokens > token_limit && preserved.len() > 1 {
        let evicted = preserved.remove(0);
        preserved_tokens -= estimate_message_tokens(&evicted);
        dropped += 1;
    }

    if summary_tokens + preserved_tokens <= token_limit {
        return (summary, preserved, dropped);
    }

    let budget = token_limit.saturating_sub(preserved_tokens);
    (truncate_to_tokens(&summary, budget), preserved, dropped)
}

/// Longest prefix of `text` whose estimate stays within `max_tokens`.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_units = max_tokens.saturating_mul(4);
    let mut units = 0;
    let mut end = 0;
    for (index, ch) in text.char_indices() {
        units += ch.len_utf16();
        if units > max_units {
            break;
        }
        end = index + ch.len_utf8();
    }
    text[..end].to_string()
}

/// The summarizer has no tools, so it never delegates.
struct NoDelegation;

#[async_trait]
impl Delegate for NoDelegation {
    async fn delegate(
        &self,
        ctx: &DelegationContext,
        from: &str,
        _to: &str,
        _input: &str,
    ) -> Result<AgentRunResponse, Error> {
        let mut chain = ctx.chain.clone();
        chain.push(from.to_string());
        Err(AgentError::DepthExceeded {
            depth: ctx.depth + 1,
            max: 0,
            chain,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::InMemoryConversationStore;
    use crate::testing::StubRunner;
    use pretty_assertions::assert_eq;

    /// A message estimated at exactly `tokens` tokens.
    fn msg(tokens: usize) -> Message {
        Message::user("x".repeat(tokens * 4))
    }

    fn compactor(store: Arc<InMemoryConversationStore>, runner: Arc<StubRunner>) -> Compactor {
        Compactor::new(
            store,
            runner,
            ResilienceConfig {
                jitter: 0.0,
                ..ResilienceConfig::default()
            },
            Arc::new(HookEmitter::default()),
        )
    }

    #[test]
    fn test_needs_compaction() {
        let messages = vec![msg(10), msg(10)];
        assert!(!Compactor::needs_compaction(&messages, 20));
        assert!(Compactor::needs_compaction(&messages, 19));
    }

    #[test]
    fn test_split_point_walks_from_newest() {
        let messages = vec![msg(5), msg(5), msg(5), msg(5)];
        assert_eq!(split_point(&messages, 10), 2);
        assert_eq!(split_point(&messages, 12), 2);
        assert_eq!(split_point(&messages, 100), 0);
        // Newest alone is over budget: nothing preserved.
        assert_eq!(split_point(&messages, 4), 4);
    }

    #[test]
    fn test_transcript_tags_previous_summaries() {
        let transcript = format_transcript(&[
            Message::summary("earlier stuff", 4),
            Message::user("next question"),
        ]);
        assert_eq!(
            transcript,
            "[Previous Summary]: earlier stuff\n\nuser: next question"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_to_tokens("abcdefgh", 1), "abcd");
        assert_eq!(truncate_to_tokens("ab😀cd", 1), "ab😀");
        assert_eq!(truncate_to_tokens("😀😀😀", 0), "");
    }

    #[test]
    fn test_fit_to_limit_evicts_then_truncates() {
        let summary = "s".repeat(40); // 10 tokens
        let preserved = vec![msg(10), msg(10), msg(10)];

        let (s, kept, dropped) = fit_to_limit(summary.clone(), preserved.clone(), 25);
        assert_eq!(s, summary);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 2);

        let (s, kept, dropped) = fit_to_limit(summary, preserved, 14);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 2);
        assert_eq!(estimate_tokens(&s), 4);
    }

    #[tokio::test]
    async fn test_missing_or_empty_conversation() {
        let store = Arc::new(InMemoryConversationStore::new());
        let runner = Arc::new(StubRunner::new());
        let compactor = compactor(Arc::clone(&store), Arc::clone(&runner));

        assert_eq!(compactor.compact("nope", CompactionOptions::default()).await.unwrap(), None);
        store.append("empty", &[]).await.unwrap();
        assert_eq!(compactor.compact("empty", CompactionOptions::default()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_everything_fits_is_noop() {
        let store = Arc::new(InMemoryConversationStore::new());
        let runner = Arc::new(StubRunner::new());
        store.append("c", &[msg(100), msg(100)]).await.unwrap();

        let result = compactor(Arc::clone(&store), Arc::clone(&runner))
            .compact("c", CompactionOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.summarized_count, 0);
        assert_eq!(result.summary, None);
        assert_eq!(runner.calls(), 0);
        assert_eq!(store.get("c").await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_compaction_rewrites_history() {
        let store = Arc::new(InMemoryConversationStore::new());
        let runner = Arc::new(StubRunner::new().with_response("short recap"));
        store
            .append(
                "c",
                &[Message::summary("old recap", 3), msg(50), msg(50), msg(20), msg(20)],
            )
            .await
            .unwrap();

        let options = CompactionOptions {
            preserve_tokens: 40,
            ..CompactionOptions::default()
        };
        let result = compactor(Arc::clone(&store), Arc::clone(&runner))
            .compact("c", options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.summarized_count, 3);
        assert_eq!(result.preserved_count, 2);
        assert_eq!(result.dropped_count, 0);
        assert_eq!(runner.calls(), 1);

        let request = &runner.requests()[0];
        assert!(request.input.starts_with("[Previous Summary]: old recap"));
        assert_eq!(request.system, DEFAULT_COMPACTION_PROMPT);

        let history = store.get("c").await.unwrap().unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "short recap");
        assert_eq!(
            history[0].compaction,
            Some(crate::conversation::CompactionMarker { summarized_count: 3 })
        );
        assert_eq!(history[1], msg(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_appended_during_summary_survive() {
        let store = Arc::new(InMemoryConversationStore::new());
        let runner = Arc::new(
            StubRunner::new()
                .with_response("recap")
                .with_delay(std::time::Duration::from_secs(5)),
        );
        store.append("c", &[msg(50), msg(50), msg(3)]).await.unwrap();

        let compaction = tokio::spawn({
            let compactor = compactor(Arc::clone(&store), Arc::clone(&runner));
            async move {
                compactor
                    .compact(
                        "c",
                        CompactionOptions {
                            preserve_tokens: 3,
                            ..CompactionOptions::default()
                        },
                    )
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        store.append("c", &[Message::user("arrived late")]).await.unwrap();

        let result = compaction.await.unwrap().unwrap().unwrap();
        assert_eq!(result.summarized_count, 2);

        let contents: Vec<String> = store
            .get("c")
            .await
            .unwrap()
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["recap".to_string(), "x".repeat(12), "arrived late".to_string()]);
    }

    #[tokio::test]
    async fn test_overflow_evicts_preserved_messages() {
        let store = Arc::new(InMemoryConversationStore::new());
        // 30-token summary.
        let runner = Arc::new(StubRunner::new().with_response("y".repeat(120)));
        store
            .append("c", &[msg(100), msg(10), msg(10), msg(10), msg(10)])
            .await
            .unwrap();

        let options = CompactionOptions {
            preserve_tokens: 40,
            token_limit: 55,
            ..CompactionOptions::default()
        };
        let result = compactor(Arc::clone(&store), Arc::clone(&runner))
            .compact("c", options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(result.summarized_count, 1);
        assert_eq!(result.dropped_count, 2);
        assert_eq!(result.preserved_count, 2);
        assert!(result.tokens_after <= 55);
        assert_eq!(store.get("c").await.unwrap().unwrap().len(), 3);
    }
}
