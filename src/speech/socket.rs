//! Streaming voice socket
//!
//! Keeps a websocket to `/ws/voice/<client-id>` open, sends utterances to be
//! synthesized server side, and feeds every binary frame that comes back
//! into the playback queue in arrival order.

use crate::audio::{ErrorCallback, PlaybackHandle};
use crate::{ErrorKind, VoxError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Delay before reconnecting after the socket closes
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Outgoing<'a> {
    Tts { text: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Control {
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// `client-` followed by nine random base-36 characters
pub fn generate_client_id() -> String {
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut value = Uuid::new_v4().as_u128();
    let suffix: String = (0..9)
        .map(|_| {
            let c = ALPHABET[(value % 36) as usize] as char;
            value /= 36;
            c
        })
        .collect();
    format!("client-{}", suffix)
}

/// Websocket origin for an HTTP API base, e.g.
/// `http://localhost:8001/api` -> `ws://localhost:8001`
pub fn socket_origin(api_base: &str) -> String {
    let (scheme, rest) = match api_base.split_once("://") {
        Some(("https", rest)) | Some(("wss", rest)) => ("wss", rest),
        Some((_, rest)) => ("ws", rest),
        None => ("ws", api_base),
    };
    let host = rest.split('/').next().unwrap_or(rest);
    format!("{}://{}", scheme, host)
}

type Outbox = Arc<Mutex<Option<mpsc::UnboundedSender<Message>>>>;

/// A reconnecting websocket that turns text into queued audio
pub struct VoiceSocket {
    client_id: String,
    url: String,
    outbox: Outbox,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl VoiceSocket {
    /// Start connecting in the background. Must be called inside a tokio runtime.
    pub fn connect(
        origin: &str,
        playback: PlaybackHandle,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        let client_id = generate_client_id();
        let url = format!("{}/ws/voice/{}", origin.trim_end_matches('/'), client_id);
        let outbox: Outbox = Arc::new(Mutex::new(None));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            url.clone(),
            playback,
            on_error,
            Arc::clone(&outbox),
            shutdown_rx,
        ));

        Self {
            client_id,
            url,
            outbox,
            shutdown,
            task,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.lock().is_some()
    }

    /// Ask the server to synthesize `text`. Returns `false` when not connected.
    pub fn send_text(&self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() {
            return false;
        }
        let payload = match serde_json::to_string(&Outgoing::Tts { text }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Failed to encode voice message: {}", e);
                return false;
            }
        };

        match self.outbox.lock().as_ref() {
            Some(outbox) => outbox.send(Message::Text(payload)).is_ok(),
            None => false,
        }
    }

    /// Close the socket and stop reconnecting
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!("Voice socket task ended abnormally: {}", e);
        }
    }
}

fn report(on_error: &Option<ErrorCallback>, error: VoxError) {
    warn!("Voice socket: {}", error);
    if let Some(on_error) = on_error {
        on_error(&error);
    }
}

async fn run(
    url: String,
    playback: PlaybackHandle,
    on_error: Option<ErrorCallback>,
    outbox: Outbox,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                info!("Voice socket connected: {}", url);
                let (mut write, mut read) = stream.split();
                let (tx, mut rx) = mpsc::unbounded_channel();
                *outbox.lock() = Some(tx);

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            outbox.lock().take();
                            let _ = write.send(Message::Close(None)).await;
                            info!("Voice socket closed");
                            return;
                        }
                        Some(message) = rx.recv() => {
                            if let Err(e) = write.send(message).await {
                                report(&on_error, VoxError::tts(ErrorKind::NetworkError, e.to_string()));
                                break;
                            }
                        }
                        incoming = read.next() => match incoming {
                            Some(Ok(Message::Binary(frame))) => {
                                debug!("Voice frame: {} bytes", frame.len());
                                if let Err(e) = playback.enqueue_bytes(frame, None) {
                                    report(&on_error, e);
                                }
                            }
                            Some(Ok(Message::Text(text))) => match serde_json::from_str::<Control>(&text) {
                                Ok(Control::Error { message }) => {
                                    report(&on_error, VoxError::tts(ErrorKind::UpstreamError, message));
                                }
                                Ok(Control::Other) => debug!("Ignoring control message: {}", text),
                                Err(e) => warn!("Unparseable control message: {}", e),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                report(&on_error, VoxError::tts(ErrorKind::NetworkError, e.to_string()));
                                break;
                            }
                        }
                    }
                }

                outbox.lock().take();
                info!("Voice socket disconnected");
            }
            Err(e) => {
                report(
                    &on_error,
                    VoxError::tts(
                        ErrorKind::NetworkError,
                        format!("Connection error. Trying to reconnect... ({})", e),
                    ),
                );
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
