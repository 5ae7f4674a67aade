//! Text-to-speech over HTTP, and the speaker that plays the result
//!
//! [`TtsClient`] fetches whole utterances as encoded audio from `POST /tts`.
//! [`Speaker`] hands the bytes to the playback queue, tagged with their text
//! so the queue can fall back to local speech when they cannot be played.

use crate::audio::{AudioChunk, PlaybackHandle};
use crate::speech::socket::VoiceSocket;
use crate::messages::{ChatMessage, Role};
use crate::{ErrorKind, Result, VoxError};
use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_VOICE: &str = "en-US-AriaNeural";
pub const DEFAULT_RATE: &str = "+0%";
pub const DEFAULT_VOLUME: &str = "+0%";

/// Which completed messages are spoken without being asked
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoSpeak {
    Off,
    #[default]
    AssistantOnly,
    All,
}

impl AutoSpeak {
    pub fn applies_to(&self, message: &ChatMessage) -> bool {
        if message.is_generating || message.is_failed() || message.content.trim().is_empty() {
            return false;
        }
        match self {
            AutoSpeak::Off => false,
            AutoSpeak::AssistantOnly => message.role == Role::Assistant,
            AutoSpeak::All => message.role != Role::System,
        }
    }
}

impl std::str::FromStr for AutoSpeak {
    type Err = VoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(AutoSpeak::Off),
            "assistant-only" | "assistant" => Ok(AutoSpeak::AssistantOnly),
            "all" => Ok(AutoSpeak::All),
            other => Err(VoxError::ConfigError(format!(
                "unknown auto-speak policy '{}'",
                other
            ))),
        }
    }
}

/// Voice parameters sent with every synthesis request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TtsSettings {
    pub enabled: bool,
    pub voice: String,
    /// Relative speaking rate, e.g. `+10%`
    pub rate: String,
    /// Relative volume, e.g. `-20%`
    pub volume: String,
    pub auto_speak: AutoSpeak,
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            voice: DEFAULT_VOICE.to_string(),
            rate: DEFAULT_RATE.to_string(),
            volume: DEFAULT_VOLUME.to_string(),
            auto_speak: AutoSpeak::default(),
        }
    }
}

impl TtsSettings {
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }

    pub fn with_rate(mut self, rate: impl Into<String>) -> Self {
        self.rate = rate.into();
        self
    }

    pub fn with_volume(mut self, volume: impl Into<String>) -> Self {
        self.volume = volume.into();
        self
    }

    pub fn with_auto_speak(mut self, auto_speak: AutoSpeak) -> Self {
        self.auto_speak = auto_speak;
        self
    }

    /// Check rate and volume look like `+N%` / `-N%`
    pub fn validate(&self) -> Result<()> {
        if self.voice.trim().is_empty() {
            return Err(VoxError::ConfigError("TTS voice must not be empty".into()));
        }
        for (name, value) in [("rate", &self.rate), ("volume", &self.volume)] {
            if !is_percent_offset(value) {
                return Err(VoxError::ConfigError(format!(
                    "TTS {} must look like +10% or -10%, got '{}'",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

fn is_percent_offset(value: &str) -> bool {
    let Some(rest) = value.strip_prefix('+').or_else(|| value.strip_prefix('-')) else {
        return false;
    };
    match rest.strip_suffix('%') {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: &'a str,
    volume: &'a str,
}

/// One voice offered by the TTS backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VoiceInfo {
    pub short_name: String,
    #[serde(default)]
    pub locale: String,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VoiceList {
    voices: Vec<VoiceInfo>,
}

/// Client for the `/tts` endpoints
#[derive(Clone)]
pub struct TtsClient {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl TtsClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| VoxError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn transport_error(e: reqwest::Error) -> VoxError {
        VoxError::tts(VoxError::from_transport(&e), e.to_string())
    }

    /// Fetch encoded audio for one utterance
    pub async fn synthesize(&self, text: &str, settings: &TtsSettings) -> Result<Bytes> {
        let body = SynthesisRequest {
            text,
            voice: &settings.voice,
            rate: &settings.rate,
            volume: &settings.volume,
        };

        debug!("POST tts: {} chars, voice={}", text.len(), settings.voice);
        let response = self
            .client
            .post(format!("{}/tts", self.base_url))
            .json(&body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(Self::transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(VoxError::tts(
                ErrorKind::UpstreamError,
                format!("TTS request failed with status {}", status),
            ));
        }

        let audio = response.bytes().await.map_err(Self::transport_error)?;
        if audio.is_empty() {
            return Err(VoxError::tts(
                ErrorKind::MalformedResponse,
                "TTS returned no audio",
            ));
        }
        Ok(audio)
    }

    /// Voices offered by the backend, optionally for one locale
    pub async fn voices(&self, locale: Option<&str>) -> Result<Vec<VoiceInfo>> {
        let mut request = self
            .client
            .get(format!("{}/tts/voices", self.base_url))
            .timeout(self.timeout);
        if let Some(locale) = locale {
            request = request.query(&[("locale", locale)]);
        }

        let response = request.send().await.map_err(Self::transport_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(VoxError::tts(
                ErrorKind::UpstreamError,
                format!("voice listing failed with status {}", status),
            ));
        }

        let list = response
            .json::<VoiceList>()
            .await
            .map_err(Self::transport_error)?;
        Ok(list.voices)
    }
}

/// Speaks text through the TTS backend and the playback queue.
///
/// With a voice socket attached, text goes over the socket while it is
/// connected and the HTTP endpoint is only used when it is not.
#[derive(Clone)]
pub struct Speaker {
    client: TtsClient,
    playback: PlaybackHandle,
    settings: Arc<RwLock<TtsSettings>>,
    socket: Option<Arc<VoiceSocket>>,
    /// Whether the playback queue has a local speech fallback
    fallback_available: bool,
}

impl Speaker {
    pub fn new(client: TtsClient, playback: PlaybackHandle, settings: TtsSettings) -> Self {
        Self {
            client,
            playback,
            settings: Arc::new(RwLock::new(settings)),
            socket: None,
            fallback_available: false,
        }
    }

    pub fn with_fallback_available(mut self, available: bool) -> Self {
        self.fallback_available = available;
        self
    }

    /// Prefer `socket` for synthesis; its audio must feed the same playback queue
    pub fn with_socket(mut self, socket: VoiceSocket) -> Self {
        self.socket = Some(Arc::new(socket));
        self
    }

    pub fn settings(&self) -> TtsSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: TtsSettings) {
        *self.settings.write() = settings;
    }

    pub fn playback(&self) -> &PlaybackHandle {
        &self.playback
    }

    /// Replace whatever is being spoken with `text`
    pub async fn speak(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let settings = self.settings();
        if !settings.enabled {
            debug!("TTS disabled, not speaking");
            return Ok(());
        }

        self.playback.stop()?;

        if let Some(socket) = &self.socket {
            if socket.send_text(text) {
                debug!("Sent {} chars over the voice socket", text.len());
                return Ok(());
            }
            debug!("Voice socket down, using the TTS endpoint");
        }

        match self.client.synthesize(text, &settings).await {
            Ok(audio) => {
                info!("Speaking {} chars ({} bytes of audio)", text.len(), audio.len());
                self.playback.enqueue(AudioChunk::new(audio).with_text(text))?;
                Ok(())
            }
            Err(e) if self.fallback_available => {
                warn!("TTS fetch failed, using local speech: {}", e);
                self.playback.enqueue(AudioChunk::text_only(text))?;
                Ok(())
            }
            Err(e) => Err(VoxError::tts(
                ErrorKind::UnsupportedCapability,
                format!("TTS failed and no local speech is available: {}", e),
            )),
        }
    }

    /// Speak a completed message if the auto-speak policy covers it
    pub async fn auto_speak(&self, message: &ChatMessage) -> Result<bool> {
        let settings = self.settings();
        if !settings.enabled || !settings.auto_speak.applies_to(message) {
            return Ok(false);
        }
        self.speak(&message.content).await?;
        Ok(true)
    }

    pub fn stop(&self) -> Result<()> {
        self.playback.stop()
    }

    pub fn is_speaking(&self) -> bool {
        self.playback.is_playing()
    }
}
