//! Prompt-cache prefix optimizer.
//!
//! Provider prompt caches discount the longest prefix that is byte-identical
//! across requests. Stable content (system prompts, pinned context) belongs
//! at the front; per-turn content after it. This pass performs that stable
//! partition without changing relative order inside either group, so the
//! conversation's meaning is untouched.

use crate::message::{Message, Role};
use crate::tokens::TokenEncoder;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PrefixReport {
    /// Messages whose position changed.
    pub moved: usize,
    /// Token length of the stable leading block.
    pub stable_prefix_tokens: u32,
}

pub struct PrefixOptimizer {
    encoder: Arc<dyn TokenEncoder>,
}

impl PrefixOptimizer {
    pub fn new(encoder: Arc<dyn TokenEncoder>) -> Self {
        Self { encoder }
    }

    fn is_stable(message: &Message) -> bool {
        message.role == Role::System || message.pinned
    }

    /// Stable-partition messages into (system ∪ pinned) followed by the
    /// volatile remainder.
    pub fn optimize(&self, messages: &[Message]) -> (Vec<Message>, PrefixReport) {
        let mut stable = Vec::new();
        let mut volatile = Vec::new();
        for message in messages {
            if Self::is_stable(message) {
                stable.push(message.clone());
            } else {
                volatile.push(message.clone());
            }
        }

        let stable_prefix_tokens = stable
            .iter()
            .map(|m| self.encoder.message_tokens(m))
            .sum();

        let mut reordered = stable;
        reordered.extend(volatile);

        let moved = reordered
            .iter()
            .zip(messages.iter())
            .filter(|(a, b)| a != b)
            .count();

        (
            reordered,
            PrefixReport {
                moved,
                stable_prefix_tokens,
            },
        )
    }
}
