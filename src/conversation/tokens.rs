//! Token estimation.
//!
//! A fixed heuristic of one token per four UTF-16 code units, rounded up.
//! Good enough for budgeting; not a tokenizer.

use crate::conversation::Message;

pub fn estimate_tokens(text: &str) -> usize {
    text.encode_utf16().count().div_ceil(4)
}

pub fn estimate_message_tokens(message: &Message) -> usize {
    estimate_tokens(&message.content)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}
