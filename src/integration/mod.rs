//! Wiring: process config, user settings and the chat session

pub mod config;
pub mod session;
pub mod settings;

pub use config::{AppConfig, API_URL_ENV};
pub use session::ChatSession;
pub use settings::{Settings, SettingsStore, Theme, SETTINGS_KEY};
