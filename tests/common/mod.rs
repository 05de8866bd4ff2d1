#![allow(dead_code)]

use tokenshield::config::schema::ModelCandidate;
use tokenshield::router::ComplexityTier;
use tokenshield::{GenerateOutput, GenerateParams, Message, ShieldConfig, Usage};

/// Base config used across suites: guard debounce off so repeated prompts
/// reach the cache stages, everything else defaults.
pub fn base_config() -> ShieldConfig {
    let mut config = ShieldConfig::default();
    config.guard.debounce_ms = 0;
    config
}

pub fn config_with_router() -> ShieldConfig {
    let mut config = base_config();
    config.router.candidates = vec![
        ModelCandidate {
            model_id: "gpt-4o-mini".into(),
            tier: ComplexityTier::Simple,
        },
        ModelCandidate {
            model_id: "gpt-4.1".into(),
            tier: ComplexityTier::Moderate,
        },
        ModelCandidate {
            model_id: "gpt-4o".into(),
            tier: ComplexityTier::Complex,
        },
    ];
    config
}

pub fn user_params(prompt: &str, model: &str, user: &str) -> GenerateParams {
    GenerateParams {
        model_id: model.into(),
        messages: vec![Message::user(prompt)],
        max_output_tokens: 256,
        user_id: Some(user.into()),
    }
}

pub fn params(prompt: &str, model: &str) -> GenerateParams {
    GenerateParams {
        model_id: model.into(),
        messages: vec![Message::user(prompt)],
        max_output_tokens: 256,
        user_id: None,
    }
}

pub fn output(text: &str, input: u32, out: u32) -> GenerateOutput {
    GenerateOutput {
        text: text.into(),
        usage: Usage {
            input_tokens: input,
            output_tokens: out,
            cached_tokens: 0,
        },
        cached: false,
    }
}

/// A 20-turn development conversation large enough to overflow a small
/// context budget.
pub fn dev_conversation() -> Vec<Message> {
    let mut messages = vec![Message::system("You are a helpful coding assistant.")];
    for i in 0..9 {
        messages.push(Message::user(format!(
            "Earlier question number {} about the build system, with plenty of \
             surrounding detail to give the message real token weight in the \
             conversation history. {}",
            i,
            "More context. ".repeat(10)
        )));
        messages.push(Message::assistant(format!(
            "Earlier answer number {} explaining the build system behaviour in \
             similar verbose detail for the history. {}",
            i,
            "More explanation. ".repeat(10)
        )));
    }
    messages.push(Message::user("quick follow-up: which flag enables it?"));
    messages
}
