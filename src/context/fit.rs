use crate::config::ContextConfig;
use crate::message::{Message, Role};
use crate::tokens::{CHAT_FRAMING_OVERHEAD, TokenEncoder};
use std::sync::Arc;

/// Outcome of a trimming pass. `messages` preserves original order: the
/// pinned block first, then kept unpinned messages chronologically.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub messages: Vec<Message>,
    pub total_tokens: u32,
    pub evicted_count: usize,
    pub evicted_tokens: u32,
    pub budget_used: u32,
    pub budget_remaining: u32,
    /// The evicted messages, oldest first; feeds the smart-fit summary.
    pub evicted: Vec<Message>,
}

/// Fits message sequences into the input token budget. Deterministic; cannot
/// fail.
pub struct ContextManager {
    encoder: Arc<dyn TokenEncoder>,
    config: ContextConfig,
}

impl ContextManager {
    pub fn new(encoder: Arc<dyn TokenEncoder>, config: ContextConfig) -> Self {
        Self { encoder, config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn encoder(&self) -> &Arc<dyn TokenEncoder> {
        &self.encoder
    }

    /// Input budget: max context minus output reservation and tool overhead.
    pub fn budget(&self) -> u32 {
        self.config
            .max_context_tokens
            .saturating_sub(self.config.reserved_for_output)
            .saturating_sub(self.config.tool_token_overhead)
    }

    fn is_pinned(message: &Message) -> bool {
        message.pinned || message.role == Role::System
    }

    /// Keep every pinned message, then newest-first as many unpinned
    /// messages as fit the remaining budget.
    pub fn fit_to_budget(&self, messages: &[Message]) -> FitResult {
        let budget = self.budget();
        let mut pinned = Vec::new();
        let mut unpinned = Vec::new();
        for (idx, message) in messages.iter().enumerate() {
            if Self::is_pinned(message) {
                pinned.push((idx, message.clone()));
            } else {
                unpinned.push((idx, message.clone()));
            }
        }

        let pinned_tokens: u32 = pinned
            .iter()
            .map(|(_, m)| self.encoder.message_tokens(m))
            .sum();
        let mut remaining =
            budget.saturating_sub(CHAT_FRAMING_OVERHEAD).saturating_sub(pinned_tokens);

        let mut kept: Vec<(usize, Message)> = Vec::new();
        let mut evicted: Vec<Message> = Vec::new();
        let mut kept_tokens: u32 = 0;
        for (idx, message) in unpinned.into_iter().rev() {
            let cost = self.encoder.message_tokens(&message);
            if cost <= remaining {
                remaining -= cost;
                kept_tokens += cost;
                kept.push((idx, message));
            } else {
                evicted.push(message);
            }
        }
        kept.sort_by_key(|(idx, _)| *idx);
        evicted.reverse(); // oldest first

        let evicted_tokens: u32 = evicted.iter().map(|m| self.encoder.message_tokens(m)).sum();
        let total_tokens = CHAT_FRAMING_OVERHEAD + pinned_tokens + kept_tokens;
        let mut result_messages: Vec<Message> =
            pinned.into_iter().map(|(_, m)| m).collect();
        result_messages.extend(kept.into_iter().map(|(_, m)| m));

        FitResult {
            messages: result_messages,
            total_tokens,
            evicted_count: evicted.len(),
            evicted_tokens,
            budget_used: total_tokens,
            budget_remaining: budget.saturating_sub(total_tokens),
            evicted,
        }
    }

    /// Keep the pinned block plus the last `n` unpinned messages.
    pub fn sliding_window(&self, messages: &[Message], n: usize) -> Vec<Message> {
        let unpinned_count = messages.iter().filter(|m| !Self::is_pinned(m)).count();
        let skip = unpinned_count.saturating_sub(n);
        let mut seen = 0;
        messages
            .iter()
            .filter(|m| {
                if Self::is_pinned(m) {
                    true
                } else {
                    seen += 1;
                    seen > skip
                }
            })
            .cloned()
            .collect()
    }

    /// Greedy-pack unpinned messages by `priority desc, timestamp desc`,
    /// then restore chronological order among the kept ones.
    pub fn priority_fit(&self, messages: &[Message]) -> FitResult {
        let budget = self.budget();
        let mut pinned = Vec::new();
        let mut unpinned = Vec::new();
        for (idx, message) in messages.iter().enumerate() {
            if Self::is_pinned(message) {
                pinned.push(message.clone());
            } else {
                unpinned.push((idx, message.clone()));
            }
        }

        let pinned_tokens: u32 = pinned.iter().map(|m| self.encoder.message_tokens(m)).sum();
        let mut remaining =
            budget.saturating_sub(CHAT_FRAMING_OVERHEAD).saturating_sub(pinned_tokens);

        let mut ranked = unpinned;
        ranked.sort_by(|(_, a), (_, b)| {
            b.priority
                .unwrap_or(0)
                .cmp(&a.priority.unwrap_or(0))
                .then_with(|| b.timestamp.unwrap_or(0).cmp(&a.timestamp.unwrap_or(0)))
        });

        let mut kept: Vec<(usize, Message)> = Vec::new();
        let mut evicted: Vec<(usize, Message)> = Vec::new();
        let mut kept_tokens: u32 = 0;
        for (idx, message) in ranked {
            let cost = self.encoder.message_tokens(&message);
            if cost <= remaining {
                remaining -= cost;
                kept_tokens += cost;
                kept.push((idx, message));
            } else {
                evicted.push((idx, message));
            }
        }
        // Chronological order among kept: timestamp asc, original index as
        // the tiebreaker.
        kept.sort_by(|(ia, a), (ib, b)| {
            a.timestamp
                .unwrap_or(0)
                .cmp(&b.timestamp.unwrap_or(0))
                .then_with(|| ia.cmp(ib))
        });
        evicted.sort_by_key(|(idx, _)| *idx);

        let evicted: Vec<Message> = evicted.into_iter().map(|(_, m)| m).collect();
        let evicted_tokens: u32 = evicted.iter().map(|m| self.encoder.message_tokens(m)).sum();
        let total_tokens = CHAT_FRAMING_OVERHEAD + pinned_tokens + kept_tokens;
        let mut result_messages = pinned;
        result_messages.extend(kept.into_iter().map(|(_, m)| m));

        FitResult {
            messages: result_messages,
            total_tokens,
            evicted_count: evicted.len(),
            evicted_tokens,
            budget_used: total_tokens,
            budget_remaining: budget.saturating_sub(total_tokens),
            evicted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::tokens::HeuristicEncoder;

    fn manager(max: u32, reserved: u32) -> ContextManager {
        let config = ContextConfig {
            max_context_tokens: max,
            reserved_for_output: reserved,
            ..ContextConfig::default()
        };
        ContextManager::new(Arc::new(HeuristicEncoder), config)
    }

    fn filler(chars: usize) -> String {
        "x".repeat(chars)
    }

    #[test]
    fn budget_subtracts_reservations() {
        assert_eq!(manager(1000, 200).budget(), 800);
    }

    #[test]
    fn everything_fits_when_budget_allows() {
        let m = manager(10_000, 1000);
        let messages = vec![
            Message::system("be helpful"),
            Message::user("question one"),
            Message::assistant("answer one"),
        ];
        let result = m.fit_to_budget(&messages);
        assert_eq!(result.messages.len(), 3);
        assert_eq!(result.evicted_count, 0);
        assert_eq!(result.evicted_tokens, 0);
    }

    #[test]
    fn exact_budget_keeps_all() {
        let m = manager(10_000, 1000);
        let messages = vec![Message::user("abcd")];
        let total = m.fit_to_budget(&messages).total_tokens;

        // Re-run with a budget exactly equal to the total cost: strict <=
        // keeps everything
        let exact = ContextManager::new(
            Arc::new(HeuristicEncoder),
            ContextConfig {
                max_context_tokens: total,
                reserved_for_output: 0,
                ..ContextConfig::default()
            },
        );
        let result = exact.fit_to_budget(&messages);
        assert_eq!(result.evicted_count, 0);
        assert_eq!(result.budget_remaining, 0);
    }

    #[test]
    fn evicts_oldest_unpinned_first() {
        let m = manager(60, 0);
        let messages = vec![
            Message::user(filler(80)),  // oldest, should evict
            Message::user(filler(80)),
            Message::user(filler(40)),  // newest, kept
        ];
        let result = m.fit_to_budget(&messages);
        assert!(result.evicted_count >= 1);
        // Newest survives
        assert!(result.messages.iter().any(|msg| msg.content == filler(40)));
        // Oldest evicted before newest
        assert_eq!(result.evicted[0].content, filler(80));
    }

    #[test]
    fn pinned_and_system_always_retained() {
        let m = manager(20, 0); // tiny budget
        let messages = vec![
            Message::system(filler(100)),
            Message::user(filler(100)).pinned(),
            Message::user(filler(100)),
        ];
        let result = m.fit_to_budget(&messages);
        assert_eq!(result.evicted_count, 1);
        assert_eq!(result.messages.len(), 2);
        assert!(result.messages.iter().all(|msg| msg.pinned || msg.role == Role::System));
    }

    #[test]
    fn kept_messages_preserve_original_order() {
        let m = manager(10_000, 0);
        let messages = vec![
            Message::user("one"),
            Message::system("sys"),
            Message::user("two"),
        ];
        let result = m.fit_to_budget(&messages);
        // Pinned block first, then chronological unpinned
        assert_eq!(result.messages[0].content, "sys");
        assert_eq!(result.messages[1].content, "one");
        assert_eq!(result.messages[2].content, "two");
    }

    #[test]
    fn sliding_window_keeps_pinned_plus_tail() {
        let m = manager(10_000, 0);
        let messages = vec![
            Message::system("sys"),
            Message::user("a"),
            Message::user("b"),
            Message::user("c"),
        ];
        let window = m.sliding_window(&messages, 2);
        let contents: Vec<&str> = window.iter().map(|msg| msg.content.as_str()).collect();
        assert_eq!(contents, vec!["sys", "b", "c"]);
    }

    #[test]
    fn sliding_window_zero_keeps_only_pinned() {
        let m = manager(10_000, 0);
        let messages = vec![Message::system("sys"), Message::user("a")];
        let window = m.sliding_window(&messages, 0);
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].content, "sys");
    }

    #[test]
    fn priority_fit_prefers_high_priority() {
        let m = manager(40, 0);
        let messages = vec![
            Message::user(filler(60)).with_priority(10).with_timestamp(1),
            Message::user(filler(60)).with_priority(1).with_timestamp(2),
        ];
        let result = m.priority_fit(&messages);
        assert_eq!(result.messages.len(), 1);
        assert_eq!(result.messages[0].priority, Some(10));
    }

    #[test]
    fn priority_fit_restores_chronology() {
        let m = manager(10_000, 0);
        let messages = vec![
            Message::user("late").with_priority(1).with_timestamp(200),
            Message::user("early").with_priority(5).with_timestamp(100),
        ];
        let result = m.priority_fit(&messages);
        assert_eq!(result.messages[0].content, "early");
        assert_eq!(result.messages[1].content, "late");
    }
}
