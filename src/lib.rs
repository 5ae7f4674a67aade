pub mod audio;
pub mod chat;
pub mod integration;
pub mod messages;
pub mod speech;
pub mod storage;
pub mod ui;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classes surfaced to the user.
///
/// Every failure a chat turn, the playback queue or the recognizer can hit
/// maps onto exactly one of these, and each kind has its own stable code and
/// user-facing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// No response reached us
    NetworkError,
    /// The request did not complete in time
    Timeout,
    /// The server answered with a failure status
    UpstreamError,
    /// The response matched none of the known shapes
    MalformedResponse,
    /// Audio bytes could not be decoded or played
    DecodeError,
    /// Microphone access was refused
    PermissionDenied,
    /// The recognizer heard nothing
    NoSpeech,
    /// Voice or TTS is not available in this environment
    UnsupportedCapability,
}

impl ErrorKind {
    /// Stable kebab-case code
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network-error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamError => "upstream-error",
            ErrorKind::MalformedResponse => "malformed-response",
            ErrorKind::DecodeError => "decode-error",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::NoSpeech => "no-speech",
            ErrorKind::UnsupportedCapability => "unsupported-capability",
        }
    }

    /// Text shown in place of (or next to) the failed content
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NetworkError => {
                "Could not reach the chat server. Check that it is running."
            }
            ErrorKind::Timeout => "The model took too long to answer. Please try again.",
            ErrorKind::UpstreamError => "The chat server reported an error.",
            ErrorKind::MalformedResponse => "Received an unexpected response from the server.",
            ErrorKind::DecodeError => "Audio could not be played.",
            ErrorKind::PermissionDenied => "Microphone access was denied.",
            ErrorKind::NoSpeech => "No speech was detected. Please try again.",
            ErrorKind::UnsupportedCapability => "Voice features are not available here.",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Error, Debug, Clone)]
pub enum VoxError {
    #[error("Chat error ({kind}): {message}")]
    ChatError { kind: ErrorKind, message: String },

    #[error("TTS error ({kind}): {message}")]
    TTSError { kind: ErrorKind, message: String },

    #[error("Audio device error: {0}")]
    AudioDeviceError(String),

    #[error("Audio decode error: {0}")]
    DecodeError(String),

    #[error("Recognition error ({kind}): {message}")]
    RecognitionError { kind: ErrorKind, message: String },

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    IOError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Channel error: {0}")]
    ChannelError(String),
}

impl From<std::io::Error> for VoxError {
    fn from(e: std::io::Error) -> Self {
        VoxError::IOError(e.to_string())
    }
}

impl From<serde_json::Error> for VoxError {
    fn from(e: serde_json::Error) -> Self {
        VoxError::StorageError(e.to_string())
    }
}

impl VoxError {
    pub fn chat(kind: ErrorKind, message: impl Into<String>) -> Self {
        VoxError::ChatError {
            kind,
            message: message.into(),
        }
    }

    pub fn tts(kind: ErrorKind, message: impl Into<String>) -> Self {
        VoxError::TTSError {
            kind,
            message: message.into(),
        }
    }

    pub fn recognition(kind: ErrorKind, message: impl Into<String>) -> Self {
        VoxError::RecognitionError {
            kind,
            message: message.into(),
        }
    }

    /// Classify a transport error from the HTTP client
    pub fn from_transport(e: &reqwest::Error) -> ErrorKind {
        if e.is_timeout() {
            ErrorKind::Timeout
        } else if e.is_decode() {
            ErrorKind::MalformedResponse
        } else if e.is_status() {
            ErrorKind::UpstreamError
        } else {
            ErrorKind::NetworkError
        }
    }

    /// The taxonomy class of this error, when it has one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            VoxError::ChatError { kind, .. }
            | VoxError::TTSError { kind, .. }
            | VoxError::RecognitionError { kind, .. } => Some(*kind),
            VoxError::DecodeError(_) => Some(ErrorKind::DecodeError),
            VoxError::AudioDeviceError(_) => Some(ErrorKind::UnsupportedCapability),
            _ => None,
        }
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Transport and model failures are typically transient
            VoxError::ChatError { .. } => true,
            VoxError::TTSError { .. } => true,
            VoxError::DecodeError(_) => true,
            VoxError::RecognitionError { kind, .. } => *kind != ErrorKind::PermissionDenied,
            // Hardware/device errors may require user intervention
            VoxError::AudioDeviceError(_) => false,
            VoxError::StorageError(_) => false,
            VoxError::IOError(_) => false,
            VoxError::ConfigError(_) => false,
            VoxError::ChannelError(_) => false,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            VoxError::ChatError { kind, .. } | VoxError::RecognitionError { kind, .. } => {
                kind.user_message().to_string()
            }
            VoxError::TTSError { .. } => {
                "Text-to-speech failed. Response will be shown as text.".to_string()
            }
            VoxError::AudioDeviceError(_) => {
                "Audio device error. Please check your speakers.".to_string()
            }
            VoxError::DecodeError(_) => ErrorKind::DecodeError.user_message().to_string(),
            VoxError::StorageError(_) => "Chat history could not be saved or loaded.".to_string(),
            VoxError::IOError(_) => "File system error occurred.".to_string(),
            VoxError::ConfigError(_) => "Configuration error. Please check settings.".to_string(),
            VoxError::ChannelError(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;
