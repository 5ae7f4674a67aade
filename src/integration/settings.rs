//! User settings and their persisted store

use crate::chat::{ChatConfig, FragmentMode};
use crate::speech::TtsSettings;
use crate::storage::{get_json, set_json, KeyValueStore};
use crate::{Result, VoxError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const SETTINGS_KEY: &str = "settings";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

/// Everything the user can change at runtime
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    // Model
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,

    // Display
    pub theme: Theme,
    pub show_timestamps: bool,

    // Chat
    pub system_prompt: String,
    pub stream: bool,
    pub fragment_mode: FragmentMode,

    pub tts: TtsSettings,

    // Advanced
    pub api_endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model: "gemma3:270m".to_string(),
            temperature: 0.3,
            max_tokens: 2000,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            theme: Theme::System,
            show_timestamps: true,
            system_prompt: "You are a helpful AI assistant.".to_string(),
            stream: true,
            fragment_mode: FragmentMode::Cumulative,
            tts: TtsSettings::default(),
            api_endpoint: "http://localhost:8001/api".to_string(),
            request_timeout_secs: 120,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(VoxError::ConfigError("model must not be empty".into()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(VoxError::ConfigError(format!(
                "temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(VoxError::ConfigError("max tokens must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(VoxError::ConfigError(format!(
                "top_p must be between 0 and 1, got {}",
                self.top_p
            )));
        }
        if self.repeat_penalty <= 0.0 {
            return Err(VoxError::ConfigError("repeat penalty must be positive".into()));
        }
        if !(self.api_endpoint.starts_with("http://") || self.api_endpoint.starts_with("https://"))
        {
            return Err(VoxError::ConfigError(format!(
                "api endpoint must be an http(s) URL, got '{}'",
                self.api_endpoint
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(VoxError::ConfigError("request timeout must be positive".into()));
        }
        self.tts.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Backend configuration for the next request
    pub fn chat_config(&self) -> ChatConfig {
        let mut config = ChatConfig::new(self.model.clone())
            .with_base_url(self.api_endpoint.clone())
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
            .with_stream(self.stream)
            .with_fragment_mode(self.fragment_mode)
            .with_timeout(self.request_timeout());
        config.top_p = Some(self.top_p);
        config.top_k = Some(self.top_k);
        config.repeat_penalty = Some(self.repeat_penalty);
        config
    }
}

/// Shared settings: an immutable snapshot plus validated, persisted updates
#[derive(Clone)]
pub struct SettingsStore {
    current: Arc<RwLock<Arc<Settings>>>,
    store: Arc<dyn KeyValueStore>,
}

impl SettingsStore {
    /// Load persisted settings; invalid or missing ones give the defaults
    pub fn load(store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let settings = match get_json::<Settings>(store.as_ref(), SETTINGS_KEY)? {
            Some(settings) => match settings.validate() {
                Ok(()) => settings,
                Err(e) => {
                    info!("Stored settings rejected, using defaults: {}", e);
                    Settings::default()
                }
            },
            None => Settings::default(),
        };

        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(settings))),
            store,
        })
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        self.current.read().clone()
    }

    /// Apply a change. Nothing is stored or published when it does not validate.
    pub fn update<F>(&self, f: F) -> Result<Arc<Settings>>
    where
        F: FnOnce(&mut Settings),
    {
        let mut current = self.current.write();
        let mut next = Settings::clone(&current);
        f(&mut next);
        next.validate()?;

        set_json(self.store.as_ref(), SETTINGS_KEY, &next)?;
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        debug!("Settings updated");
        Ok(next)
    }

    pub fn reset(&self) -> Result<Arc<Settings>> {
        self.update(|settings| *settings = Settings::default())
    }
}
