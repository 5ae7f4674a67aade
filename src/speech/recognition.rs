//! Voice input state machine
//!
//! Wraps a speech recognition engine behind [`SpeechRecognizer`] and turns
//! its callbacks into at most one transcript per listening session.

use crate::{ErrorKind, Result, VoxError};
use tracing::{debug, info, warn};

/// An on-device recognizer
pub trait SpeechRecognizer: Send {
    /// Begin capturing; results arrive later as [`RecognitionEvent`]s
    fn start(&mut self) -> Result<()>;

    /// Stop capturing. Safe when idle.
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionState {
    Idle,
    Listening,
    /// No recognizer exists in this environment
    Unsupported,
}

/// Failure reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    Network,
    Aborted,
    PermissionDenied,
    NoSpeech,
    Unsupported,
}

impl RecognitionErrorKind {
    /// Connectivity-class errors are swallowed; the engine recovers by itself
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RecognitionErrorKind::Network | RecognitionErrorKind::Aborted
        )
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            RecognitionErrorKind::Network | RecognitionErrorKind::Aborted => {
                ErrorKind::NetworkError
            }
            RecognitionErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            RecognitionErrorKind::NoSpeech => ErrorKind::NoSpeech,
            RecognitionErrorKind::Unsupported => ErrorKind::UnsupportedCapability,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecognitionEvent {
    /// User pressed the voice button
    Toggle,
    Result { transcript: String, is_final: bool },
    /// The engine stopped on its own
    End,
    Error(RecognitionErrorKind),
}

/// What the caller should act on after an event
#[derive(Debug, Clone)]
pub enum RecognitionOutput {
    Transcript(String),
    Error(VoxError),
}

pub struct RecognitionMachine {
    state: RecognitionState,
    engine: Option<Box<dyn SpeechRecognizer>>,
    /// Latest non-final transcript of this session
    interim: String,
}

impl RecognitionMachine {
    pub fn new(engine: Option<Box<dyn SpeechRecognizer>>) -> Self {
        let state = if engine.is_some() {
            RecognitionState::Idle
        } else {
            RecognitionState::Unsupported
        };
        Self {
            state,
            engine,
            interim: String::new(),
        }
    }

    pub fn unsupported() -> Self {
        Self::new(None)
    }

    pub fn state(&self) -> RecognitionState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.state == RecognitionState::Listening
    }

    pub fn interim(&self) -> &str {
        &self.interim
    }

    pub fn dispatch(&mut self, event: RecognitionEvent) -> Option<RecognitionOutput> {
        match (self.state, event) {
            (RecognitionState::Unsupported, RecognitionEvent::Toggle) => {
                Some(RecognitionOutput::Error(VoxError::recognition(
                    ErrorKind::UnsupportedCapability,
                    "speech recognition is not available",
                )))
            }
            (RecognitionState::Unsupported, _) => None,

            (RecognitionState::Idle, RecognitionEvent::Toggle) => self.start(),
            (RecognitionState::Listening, RecognitionEvent::Toggle) => {
                self.stop();
                None
            }

            (RecognitionState::Listening, RecognitionEvent::Result { transcript, is_final }) => {
                if !is_final {
                    self.interim = transcript;
                    return None;
                }
                let transcript = transcript.trim().to_string();
                if transcript.is_empty() {
                    return None;
                }
                info!("Final transcript: {} chars", transcript.len());
                self.stop();
                Some(RecognitionOutput::Transcript(transcript))
            }

            // Continuous listening: the engine times out, we start it again
            (RecognitionState::Listening, RecognitionEvent::End) => {
                debug!("Recognizer ended while listening, restarting");
                let restart = match self.engine.as_mut() {
                    Some(engine) => engine.start(),
                    None => Ok(()),
                };
                match restart {
                    Ok(()) => None,
                    Err(e) => {
                        self.state = RecognitionState::Idle;
                        Some(RecognitionOutput::Error(e))
                    }
                }
            }

            (RecognitionState::Listening, RecognitionEvent::Error(kind)) if kind.is_transient() => {
                debug!("Swallowing transient recognition error {:?}", kind);
                None
            }
            (RecognitionState::Listening, RecognitionEvent::Error(kind)) => {
                warn!("Recognition failed: {:?}", kind);
                self.stop();
                Some(RecognitionOutput::Error(VoxError::recognition(
                    kind.error_kind(),
                    format!("{:?}", kind),
                )))
            }

            // Late events after stop
            (RecognitionState::Idle, _) => None,
        }
    }

    fn start(&mut self) -> Option<RecognitionOutput> {
        let Some(engine) = self.engine.as_mut() else {
            self.state = RecognitionState::Unsupported;
            return None;
        };
        match engine.start() {
            Ok(()) => {
                info!("Listening");
                self.interim.clear();
                self.state = RecognitionState::Listening;
                None
            }
            Err(e) => Some(RecognitionOutput::Error(e)),
        }
    }

    fn stop(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.stop();
        }
        self.interim.clear();
        self.state = RecognitionState::Idle;
    }
}
