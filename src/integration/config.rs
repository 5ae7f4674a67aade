//! Process-level configuration
//!
//! Read once at startup from an optional TOML file and the environment.
//! User-editable chat preferences live in [`Settings`](super::settings::Settings)
//! instead, because they are changed at runtime and persisted with the history.

use crate::{Result, VoxError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Overrides the API endpoint from the settings
pub const API_URL_ENV: &str = "VOXCHAT_API_URL";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// API base URL; when set it wins over the persisted setting
    pub api_url: Option<String>,

    /// Where history and settings are stored (default: `data_dir/voxchat`)
    pub data_dir: Option<PathBuf>,

    /// Whether to open an audio output device
    pub enable_audio_output: bool,

    /// Whether to use a system speech command when audio cannot be played
    pub enable_speech_fallback: bool,

    /// Speak through the streaming voice socket instead of `POST /tts`
    pub use_voice_socket: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            data_dir: None,
            enable_audio_output: true,
            enable_speech_fallback: true,
            use_voice_socket: false,
        }
    }
}

impl AppConfig {
    /// `config_dir/voxchat/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("voxchat").join("config.toml"))
    }

    /// Load from `path` (or the default path), then apply the environment.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);

        let mut config = match path {
            Some(path) if path.exists() => {
                info!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            _ => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };

        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                config.api_url = Some(url);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| VoxError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| VoxError::ConfigError(e.to_string()))
    }

    pub fn with_api_url(mut self, url: impl Into<String>) -> Self {
        self.api_url = Some(url.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Text-only mode
    pub fn without_audio_output(mut self) -> Self {
        self.enable_audio_output = false;
        self
    }

    pub fn without_speech_fallback(mut self) -> Self {
        self.enable_speech_fallback = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = &self.api_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(VoxError::ConfigError(format!(
                    "api_url must start with http:// or https://, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.api_url.is_none());
        assert!(config.enable_audio_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml(
            r#"
            api_url = "http://gpu-box:8001/api"
            use_voice_socket = true
            "#,
        )
        .unwrap();

        assert_eq!(config.api_url.as_deref(), Some("http://gpu-box:8001/api"));
        assert!(config.use_voice_socket);
        assert!(config.enable_speech_fallback);
    }

    #[test]
    fn test_bad_url_rejected() {
        let config = AppConfig::default().with_api_url("localhost:8001");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "data_dir = \"/tmp/voxchat-test\"").unwrap();
        writeln!(file, "enable_audio_output = false").unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/voxchat-test")));
        assert!(!config.enable_audio_output);
    }

    #[test]
    fn test_builders() {
        let config = AppConfig::default()
            .with_data_dir("/var/lib/voxchat")
            .without_audio_output()
            .without_speech_fallback();
        assert!(!config.enable_audio_output);
        assert!(!config.enable_speech_fallback);
    }
}
