use crate::message::Message;
use std::sync::Arc;

/// Structural overhead charged per message (role/content framing).
pub const MESSAGE_OVERHEAD: u32 = 4;
/// Overhead charged once per chat request.
pub const CHAT_FRAMING_OVERHEAD: u32 = 3;

/// Opaque token counter. The default implementation is a character-count
/// heuristic; callers with a real tokenizer plug it in here.
pub trait TokenEncoder: Send + Sync {
    /// Token count for a bare string.
    fn encode(&self, text: &str) -> u32;

    /// Token cost of one message: structural overhead + role + content.
    fn message_tokens(&self, message: &Message) -> u32 {
        MESSAGE_OVERHEAD + self.encode(message.role.as_str()) + self.encode(&message.content)
    }

    /// Token cost of a full chat request including framing overhead.
    fn chat_tokens(&self, messages: &[Message]) -> u32 {
        CHAT_FRAMING_OVERHEAD
            + messages
                .iter()
                .map(|m| self.message_tokens(m))
                .sum::<u32>()
    }
}

/// Approximate encoder: one token per four characters, rounded up.
/// Uses char count rather than byte length for better accuracy on
/// non-ASCII text.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicEncoder;

impl TokenEncoder for HeuristicEncoder {
    fn encode(&self, text: &str) -> u32 {
        (text.chars().count() as u32).div_ceil(4)
    }
}

/// Shared handle to the crate-default encoder.
pub fn default_encoder() -> Arc<dyn TokenEncoder> {
    Arc::new(HeuristicEncoder)
}
