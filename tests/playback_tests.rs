//! Playback worker tests with a timed fake output device

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use voxchat::audio::{
    AudioChunk, AudioSink, Completion, PlaybackHandle, PlaybackWorker, SpeechSynthesizer,
};
use voxchat::speech::{Speaker, TtsClient, TtsSettings};
use voxchat::{Result, VoxError};

/// Plays each buffer for `length`, tracking how many play at once
#[derive(Clone)]
struct TimedSink {
    length: Duration,
    played: Arc<Mutex<Vec<String>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl TimedSink {
    fn new(length: Duration) -> Self {
        Self {
            length,
            played: Arc::new(Mutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl AudioSink for TimedSink {
    fn play(&mut self, bytes: &[u8], done: Completion) -> Result<()> {
        self.played
            .lock()
            .push(String::from_utf8_lossy(bytes).to_string());

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let active = Arc::clone(&self.active);
        let length = self.length;
        thread::spawn(move || {
            thread::sleep(length);
            active.fetch_sub(1, Ordering::SeqCst);
            done(Ok(()));
        });
        Ok(())
    }

    fn stop(&mut self) {}
}

#[derive(Clone, Default)]
struct RecordingSynth {
    spoken: Arc<Mutex<Vec<String>>>,
}

impl SpeechSynthesizer for RecordingSynth {
    fn speak(&mut self, text: &str, done: Completion) -> Result<()> {
        self.spoken.lock().push(text.to_string());
        done(Ok(()));
        Ok(())
    }

    fn cancel(&mut self) {}
}

fn spawn(sink: TimedSink, fallback: Option<RecordingSynth>) -> PlaybackHandle {
    PlaybackWorker::spawn(
        move || Ok(Box::new(sink) as Box<dyn AudioSink>),
        fallback.map(|f| Box::new(f) as Box<dyn SpeechSynthesizer>),
        None,
    )
    .unwrap()
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_buffers_play_in_order_without_overlap() {
    let sink = TimedSink::new(Duration::from_millis(30));
    let handle = spawn(sink.clone(), None);

    for name in ["one", "two", "three", "four"] {
        handle.enqueue(AudioChunk::new(name.as_bytes().to_vec())).unwrap();
    }

    wait_until("all buffers played", || sink.played.lock().len() == 4);
    wait_until("queue idle", || {
        let status = handle.status();
        !status.playing && status.queued == 0
    });

    assert_eq!(*sink.played.lock(), vec!["one", "two", "three", "four"]);
    assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    handle.shutdown().unwrap();
}

#[test]
fn test_stop_then_fresh_cycle() {
    let sink = TimedSink::new(Duration::from_millis(200));
    let handle = spawn(sink.clone(), None);

    for name in ["a", "b", "c"] {
        handle.enqueue(AudioChunk::new(name.as_bytes().to_vec())).unwrap();
    }
    wait_until("first buffer started", || !sink.played.lock().is_empty());

    handle.stop().unwrap();
    wait_until("idle after stop", || !handle.is_playing());
    assert_eq!(handle.status().queued, 0);
    thread::sleep(Duration::from_millis(120));

    handle.enqueue(AudioChunk::new(b"d".to_vec())).unwrap();
    wait_until("fresh buffer started", || sink.played.lock().len() == 2);

    // The stopped buffer's late completion must not end the fresh one early
    thread::sleep(Duration::from_millis(120));
    assert!(handle.is_playing());

    wait_until("fresh buffer finished", || !handle.is_playing());
    assert_eq!(*sink.played.lock(), vec!["a", "d"]);
    handle.shutdown().unwrap();
}

#[test]
fn test_missing_device_falls_back_to_text() {
    let synth = RecordingSynth::default();
    let handle = PlaybackWorker::spawn(
        || Err(VoxError::AudioDeviceError("no device".into())),
        Some(Box::new(synth.clone()) as Box<dyn SpeechSynthesizer>),
        None,
    )
    .unwrap();

    handle
        .enqueue(AudioChunk::new(b"mp3 bytes".to_vec()).with_text("read me aloud"))
        .unwrap();

    wait_until("fallback spoke", || !synth.spoken.lock().is_empty());
    assert_eq!(*synth.spoken.lock(), vec!["read me aloud"]);
    handle.shutdown().unwrap();
}

#[tokio::test]
async fn test_speaker_uses_fallback_when_tts_is_unreachable() {
    let synth = RecordingSynth::default();
    let sink = TimedSink::new(Duration::from_millis(10));
    let playback = spawn(sink.clone(), Some(synth.clone()));

    let client = TtsClient::new("http://127.0.0.1:1/api", Duration::from_secs(2)).unwrap();
    let speaker =
        Speaker::new(client, playback.clone(), TtsSettings::default()).with_fallback_available(true);

    speaker.speak("hello there").await.unwrap();

    let spoken = Arc::clone(&synth.spoken);
    tokio::task::spawn_blocking(move || wait_until("fallback spoke", || !spoken.lock().is_empty()))
        .await
        .unwrap();
    assert_eq!(*synth.spoken.lock(), vec!["hello there"]);
    assert!(sink.played.lock().is_empty());
    playback.shutdown().unwrap();
}

#[tokio::test]
async fn test_speaker_without_fallback_reports_unsupported() {
    let playback = spawn(TimedSink::new(Duration::from_millis(10)), None);
    let client = TtsClient::new("http://127.0.0.1:1/api", Duration::from_secs(2)).unwrap();
    let speaker = Speaker::new(client, playback.clone(), TtsSettings::default());

    let err = speaker.speak("hello").await.unwrap_err();
    assert_eq!(err.kind(), Some(voxchat::ErrorKind::UnsupportedCapability));
    playback.shutdown().unwrap();
}

#[test]
fn test_handle_after_shutdown_reports_channel_error() {
    let handle = spawn(TimedSink::new(Duration::from_millis(10)), None);
    handle.shutdown().unwrap();

    // The worker drops its receiver once it has handled the shutdown
    let deadline = Instant::now() + Duration::from_secs(5);
    let err = loop {
        match handle.enqueue(AudioChunk::new(b"late".to_vec())) {
            Err(e) => break e,
            Ok(_) => {
                assert!(Instant::now() < deadline, "worker kept accepting audio");
                thread::sleep(Duration::from_millis(5));
            }
        }
    };
    assert!(matches!(err, VoxError::ChannelError(_)));
    assert!(!err.is_recoverable());
    assert!(handle.stop().is_err());
}
