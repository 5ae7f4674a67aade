//! Request context assembly
//!
//! Turns a conversation's history into the message list sent to the backend:
//! system prompt first, failed or unfinished replies dropped, oldest turns
//! trimmed to fit the context window.

use crate::chat::config::ChatConfig;
use crate::chat::wire::{ChatRequest, WireMessage};
use crate::messages::{ChatMessage, Role};

/// Builds requests for one conversation
#[derive(Clone, Debug)]
pub struct ConversationContext {
    /// System prompt (always included when non-empty)
    system_prompt: String,

    /// Maximum tokens allowed in context
    max_tokens: usize,

    /// Maximum number of history messages to send
    max_messages: usize,
}

impl ConversationContext {
    pub fn new(system_prompt: impl Into<String>, max_tokens: usize) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            max_tokens,
            max_messages: 100,
        }
    }

    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    /// Wire messages for the given history, newest last
    pub fn build_messages(&self, history: &[ChatMessage]) -> Vec<WireMessage> {
        let mut kept: Vec<&ChatMessage> = history
            .iter()
            .filter(|m| m.role != Role::System)
            .filter(|m| !m.is_generating && !m.is_failed())
            .filter(|m| !m.content.trim().is_empty())
            .collect();

        if kept.len() > self.max_messages {
            kept.drain(..kept.len() - self.max_messages);
        }

        let system_tokens = if self.system_prompt.trim().is_empty() {
            0
        } else {
            estimate_tokens(&self.system_prompt)
        };
        let mut total: usize = system_tokens + kept.iter().map(|m| estimate_tokens(&m.content)).sum::<usize>();

        // Drop oldest turns first, but never the newest message
        while total > self.max_tokens && kept.len() > 1 {
            let removed = kept.remove(0);
            total = total.saturating_sub(estimate_tokens(&removed.content));
        }

        let mut messages = Vec::with_capacity(kept.len() + 1);
        if system_tokens > 0 {
            messages.push(WireMessage {
                role: Role::System,
                content: self.system_prompt.clone(),
            });
        }
        messages.extend(kept.into_iter().map(WireMessage::from));
        messages
    }

    /// A fresh request carrying the config's model parameters
    pub fn build_request(&self, config: &ChatConfig, history: &[ChatMessage]) -> ChatRequest {
        ChatRequest {
            model: config.model.clone(),
            messages: self.build_messages(history),
            stream: config.stream,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            top_p: config.top_p,
            top_k: config.top_k,
            repeat_penalty: config.repeat_penalty,
        }
    }
}

/// Estimate token count for a string
///
/// Uses a simple heuristic: ~4 characters per token for English text.
pub fn estimate_tokens(text: &str) -> usize {
    let char_estimate = (text.len() + 3) / 4;
    let word_estimate = text.split_whitespace().count();
    char_estimate.max(word_estimate).max(1)
}
