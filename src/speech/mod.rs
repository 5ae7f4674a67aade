//! Speech output (TTS, voice socket) and speech input (recognition)

pub mod recognition;
pub mod socket;
pub mod tts;

pub use recognition::{
    RecognitionErrorKind, RecognitionEvent, RecognitionMachine, RecognitionOutput,
    RecognitionState, SpeechRecognizer,
};
pub use socket::{generate_client_id, socket_origin, VoiceSocket, RECONNECT_DELAY};
pub use tts::{AutoSpeak, Speaker, TtsClient, TtsSettings, VoiceInfo};
