//! Audio playback: a serialized queue of decodable buffers in front of one
//! output device, with a text-driven fallback

pub mod fallback;
pub mod playback;
pub mod sink;

pub use fallback::{CommandSynthesizer, SpeechSynthesizer};
pub use playback::{
    ErrorCallback, PlaybackEvent, PlaybackHandle, PlaybackQueue, PlaybackState, PlaybackStatus,
    PlaybackWorker,
};
#[cfg(feature = "audio-io")]
pub use sink::RodioSink;
pub use sink::{AudioSink, Completion};

use bytes::Bytes;
use std::sync::Arc;
use uuid::Uuid;

/// One buffer of encoded audio (wav, mp3, ...) waiting to be played
#[derive(Clone, Debug)]
pub struct AudioChunk {
    pub id: Uuid,

    /// Encoded audio bytes
    pub bytes: Bytes,

    /// The utterance the audio was synthesized from, when known
    pub text: Option<Arc<str>>,
}

impl AudioChunk {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            bytes: bytes.into(),
            text: None,
        }
    }

    /// A chunk with no audio, spoken through the text fallback
    pub fn text_only(text: impl Into<Arc<str>>) -> Self {
        Self::new(Bytes::new()).with_text(text)
    }

    pub fn with_text(mut self, text: impl Into<Arc<str>>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
