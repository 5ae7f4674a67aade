//! Chat backend configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How streamed fragments relate to each other
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentMode {
    /// Each fragment carries the full text so far and replaces the content
    #[default]
    Cumulative,
    /// Each fragment carries only new text and is appended
    Delta,
}

/// Configuration for talking to the chat backend
#[derive(Clone, Debug)]
pub struct ChatConfig {
    /// Base URL of the API, e.g. `http://localhost:8001/api`
    pub base_url: String,

    /// Model name
    pub model: String,

    /// Temperature for sampling (0.0 = deterministic, 1.0+ = creative)
    pub temperature: f32,

    /// Maximum tokens to generate per response
    pub max_tokens: u32,

    /// Top-p (nucleus) sampling parameter
    pub top_p: Option<f32>,

    /// Top-k sampling parameter
    pub top_k: Option<u32>,

    /// Repetition penalty (1.0 = no penalty)
    pub repeat_penalty: Option<f32>,

    /// Whether to request a streamed reply
    pub stream: bool,

    /// How streamed fragments are combined
    pub fragment_mode: FragmentMode,

    /// Whole-request timeout
    pub timeout: Duration,

    /// Context window budget used when trimming history
    pub context_size: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001/api".to_string(),
            model: "gemma3:270m".to_string(),
            temperature: 0.3,
            max_tokens: 2000,
            top_p: None,
            top_k: None,
            repeat_penalty: None,
            stream: true,
            fragment_mode: FragmentMode::Cumulative,
            timeout: Duration::from_secs(120),
            context_size: 8192,
        }
    }
}

impl ChatConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_fragment_mode(mut self, mode: FragmentMode) -> Self {
        self.fragment_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_context_size(mut self, context_size: usize) -> Self {
        self.context_size = context_size;
        self
    }

    /// Full URL for an endpoint below the base URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
