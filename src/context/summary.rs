use crate::context::fit::{ContextManager, FitResult};
use crate::message::{Message, Role};
use std::collections::BTreeSet;

const MAX_TOPICS: usize = 5;
const MAX_ENTITIES: usize = 10;
const MAX_DECISIONS: usize = 5;
const TOPIC_WORDS: usize = 8;

const DECISION_MARKERS: &[&str] = &[
    "decided",
    "agreed",
    "we will",
    "i will",
    "going with",
    "chose",
    "conclusion",
    "settled on",
];

impl ContextManager {
    /// `fit_to_budget`, plus a condensed summary of the evicted turns
    /// injected as a pinned system message when it still fits the budget.
    pub fn smart_fit(&self, messages: &[Message]) -> FitResult {
        let mut result = self.fit_to_budget(messages);
        if result.evicted.is_empty() {
            return result;
        }

        let summary = Message {
            role: Role::System,
            content: summarize_evicted(&result.evicted),
            priority: Some(5),
            timestamp: None,
            pinned: true,
        };
        let cost = self.encoder().message_tokens(&summary);
        if cost > result.budget_remaining {
            return result;
        }

        // Insert after the existing leading system messages.
        let insert_at = result
            .messages
            .iter()
            .position(|m| m.role != Role::System)
            .unwrap_or(result.messages.len());
        result.messages.insert(insert_at, summary);
        result.total_tokens += cost;
        result.budget_used += cost;
        result.budget_remaining -= cost;
        result
    }
}

/// Condensed reconstruction of evicted turns: one topic per user turn,
/// extracted entities, detected decisions.
pub(crate) fn summarize_evicted(evicted: &[Message]) -> String {
    let mut topics: Vec<String> = Vec::new();
    let mut entities: BTreeSet<String> = BTreeSet::new();
    let mut decisions: Vec<String> = Vec::new();

    for message in evicted {
        let text = message.content.trim();
        if text.is_empty() {
            continue;
        }

        if message.role == Role::User && topics.len() < MAX_TOPICS {
            let topic: String = text
                .split_whitespace()
                .take(TOPIC_WORDS)
                .collect::<Vec<_>>()
                .join(" ");
            if !topic.is_empty() {
                topics.push(topic);
            }
        }

        for word in text.split_whitespace() {
            let trimmed = word.trim_matches(|c: char| !c.is_alphanumeric());
            if trimmed.len() > 2
                && trimmed.chars().next().is_some_and(char::is_uppercase)
                && entities.len() < MAX_ENTITIES
            {
                entities.insert(trimmed.to_string());
            }
        }

        for sentence in text.split(['.', '!', '?']) {
            let sentence = sentence.trim();
            if sentence.is_empty() || decisions.len() >= MAX_DECISIONS {
                continue;
            }
            let sentence_lower = sentence.to_lowercase();
            if DECISION_MARKERS.iter().any(|m| sentence_lower.contains(m)) {
                decisions.push(sentence.to_string());
            }
        }
    }

    let mut lines = vec!["Previous conversation summary:".to_string()];
    if !topics.is_empty() {
        lines.push(format!("Topics discussed: {}", topics.join("; ")));
    }
    if !entities.is_empty() {
        lines.push(format!(
            "Mentioned: {}",
            entities.into_iter().collect::<Vec<_>>().join(", ")
        ));
    }
    if !decisions.is_empty() {
        lines.push(format!("Decisions: {}", decisions.join("; ")));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::context::fit::ContextManager;
    use crate::tokens::HeuristicEncoder;
    use std::sync::Arc;

    fn manager(max: u32) -> ContextManager {
        ContextManager::new(
            Arc::new(HeuristicEncoder),
            ContextConfig {
                max_context_tokens: max,
                reserved_for_output: 0,
                ..ContextConfig::default()
            },
        )
    }

    #[test]
    fn no_eviction_means_no_summary() {
        let m = manager(10_000);
        let messages = vec![Message::user("short")];
        let result = m.smart_fit(&messages);
        assert_eq!(result.messages.len(), 1);
        assert!(!result.messages[0].content.contains("summary"));
    }

    #[test]
    fn summary_injected_after_system_block() {
        let m = manager(120);
        let long = "We decided to use Postgres for the Billing service. ".repeat(10);
        let messages = vec![
            Message::system("be brief"),
            Message::user(long),
            Message::user("latest question"),
        ];
        let result = m.smart_fit(&messages);
        assert!(result.evicted_count > 0);
        // system prompt first, then the injected summary
        assert_eq!(result.messages[0].content, "be brief");
        assert!(result.messages[1].content.starts_with("Previous conversation summary:"));
        assert!(result.messages[1].pinned);
        assert_eq!(result.messages[1].priority, Some(5));
    }

    #[test]
    fn summary_omitted_when_it_does_not_fit() {
        // Budget so tight that nothing beyond the pinned block fits
        let m = manager(12);
        let messages = vec![
            Message::user("a long message that will certainly be evicted from here"),
        ];
        let result = m.smart_fit(&messages);
        assert_eq!(result.evicted_count, 1);
        assert!(result.messages.is_empty());
    }

    #[test]
    fn summarize_extracts_topics_entities_decisions() {
        let evicted = vec![
            Message::user("How should we structure the Billing database schema going forward now"),
            Message::assistant("We decided to use Postgres with partitioned tables."),
        ];
        let summary = summarize_evicted(&evicted);
        assert!(summary.starts_with("Previous conversation summary:"));
        assert!(summary.contains("Topics discussed: How should we structure the Billing"));
        assert!(summary.contains("Billing"));
        assert!(summary.contains("Postgres"));
        assert!(summary.contains("Decisions: We decided to use Postgres"));
    }

    #[test]
    fn summarize_skips_empty_messages() {
        let summary = summarize_evicted(&[Message::user(""), Message::user("   ")]);
        assert_eq!(summary, "Previous conversation summary:");
    }
}
