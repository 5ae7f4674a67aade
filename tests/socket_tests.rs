//! Voice socket against a local websocket server

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use voxchat::audio::{AudioSink, Completion, ErrorCallback, PlaybackHandle, PlaybackWorker};
use voxchat::speech::{VoiceSocket, RECONNECT_DELAY};
use voxchat::{ErrorKind, Result, VoxError};

#[derive(Clone, Default)]
struct RecordingSink {
    played: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl AudioSink for RecordingSink {
    fn play(&mut self, bytes: &[u8], done: Completion) -> Result<()> {
        self.played.lock().push(bytes.to_vec());
        done(Ok(()));
        Ok(())
    }

    fn stop(&mut self) {}
}

/// Accept one client; answer each `tts` request with two audio frames,
/// then an error control message
async fn spawn_voice_server() -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                let _ = seen_tx.send(text);
                ws.send(Message::Binary(b"frame-1".to_vec())).await.unwrap();
                ws.send(Message::Binary(b"frame-2".to_vec())).await.unwrap();
                ws.send(Message::Text(r#"{"type":"error","message":"voice busy"}"#.into()))
                    .await
                    .unwrap();
            }
        }
    });

    (format!("ws://{}", addr), seen_rx)
}

fn silent_playback() -> PlaybackHandle {
    PlaybackWorker::spawn(
        || Ok(Box::new(RecordingSink::default()) as Box<dyn AudioSink>),
        None,
        None,
    )
    .unwrap()
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_frames_are_queued_in_arrival_order() {
    let (origin, mut seen) = spawn_voice_server().await;

    let sink = RecordingSink::default();
    let played = Arc::clone(&sink.played);
    let playback = PlaybackWorker::spawn(move || Ok(Box::new(sink) as Box<dyn AudioSink>), None, None)
        .unwrap();

    let errors: Arc<Mutex<Vec<String>>> = Arc::default();
    let on_error: ErrorCallback = {
        let errors = Arc::clone(&errors);
        Arc::new(move |e: &VoxError| errors.lock().push(e.to_string()))
    };

    let socket = VoiceSocket::connect(&origin, playback.clone(), Some(on_error));
    assert!(socket.url().starts_with(&format!("{}/ws/voice/client-", origin)));

    wait_until("connected", || socket.is_connected()).await;
    assert!(!socket.send_text("   "));
    assert!(socket.send_text("say this"));

    let request = seen.recv().await.unwrap();
    let request: serde_json::Value = serde_json::from_str(&request).unwrap();
    assert_eq!(request["type"], "tts");
    assert_eq!(request["text"], "say this");

    wait_until("both frames played", || played.lock().len() == 2).await;
    assert_eq!(*played.lock(), vec![b"frame-1".to_vec(), b"frame-2".to_vec()]);

    wait_until("error reported", || !errors.lock().is_empty()).await;
    assert!(errors.lock()[0].contains("voice busy"));

    socket.close().await;
    playback.shutdown().unwrap();
}

#[tokio::test]
async fn test_send_before_connect_is_refused() {
    let playback = PlaybackWorker::spawn(
        || Err(VoxError::AudioDeviceError("none".into())),
        None,
        None,
    )
    .unwrap();

    // Nothing listens on port 1
    let socket = VoiceSocket::connect("ws://127.0.0.1:1", playback.clone(), None);
    assert!(!socket.send_text("hello"));
    assert!(!socket.is_connected());

    socket.close().await;
    playback.shutdown().unwrap();
}

#[tokio::test]
async fn test_error_control_reaches_callback() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        ws.send(Message::Text(r#"{"type":"error","message":"model not loaded"}"#.into()))
            .await
            .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let errors: Arc<Mutex<Vec<(Option<ErrorKind>, String)>>> = Arc::default();
    let on_error: ErrorCallback = {
        let errors = Arc::clone(&errors);
        Arc::new(move |e: &VoxError| errors.lock().push((e.kind(), e.to_string())))
    };

    let playback = silent_playback();
    let socket = VoiceSocket::connect(&origin, playback.clone(), Some(on_error));

    wait_until("error reported", || !errors.lock().is_empty()).await;
    let (kind, text) = errors.lock()[0].clone();
    assert_eq!(kind, Some(ErrorKind::UpstreamError));
    assert!(text.contains("model not loaded"));
    // A control message does not drop the connection
    assert!(socket.is_connected());

    socket.close().await;
    playback.shutdown().unwrap();
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = format!("ws://{}", listener.local_addr().unwrap());
    let (accepted_tx, mut accepted) = tokio::sync::mpsc::unbounded_channel();

    tokio::spawn(async move {
        // Close the first connection straight away, keep the second
        let (stream, _) = listener.accept().await.unwrap();
        let mut first = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = accepted_tx.send(Instant::now());
        let _ = first.close(None).await;

        let (stream, _) = listener.accept().await.unwrap();
        let mut second = tokio_tungstenite::accept_async(stream).await.unwrap();
        let _ = accepted_tx.send(Instant::now());
        while let Some(Ok(_)) = second.next().await {}
    });

    let playback = silent_playback();
    let socket = VoiceSocket::connect(&origin, playback.clone(), None);

    let first = accepted.recv().await.unwrap();
    let second = tokio::time::timeout(RECONNECT_DELAY + Duration::from_secs(5), accepted.recv())
        .await
        .expect("no reconnect")
        .unwrap();
    assert!(second.duration_since(first) >= RECONNECT_DELAY - Duration::from_millis(100));

    wait_until("reconnected", || socket.is_connected()).await;
    assert!(socket.send_text("back again"));

    socket.close().await;
    playback.shutdown().unwrap();
}
