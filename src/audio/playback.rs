//! Serialized audio playback queue
//!
//! [`PlaybackQueue`] is the state machine: every transition goes through
//! [`PlaybackQueue::dispatch`]. [`PlaybackWorker`] runs it on a dedicated
//! thread that owns the output device, and [`PlaybackHandle`] is the
//! cloneable front the rest of the crate talks to.

use crate::audio::fallback::SpeechSynthesizer;
use crate::audio::sink::{AudioSink, Completion};
use crate::audio::AudioChunk;
use crate::{Result, VoxError};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives every playback failure that was not recovered by the fallback
pub type ErrorCallback = Arc<dyn Fn(&VoxError) + Send + Sync>;

/// Inputs to the playback state machine
#[derive(Debug)]
pub enum PlaybackEvent {
    /// Append a buffer to the tail of the queue
    Enqueue(AudioChunk),

    /// The playback started with `token` finished naturally
    Ended { token: u64 },

    /// The playback started with `token` failed while playing
    Failed { token: u64, error: VoxError },

    /// Halt playback and discard everything queued
    Stop,

    /// Stop and end the worker thread
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Playing {
        /// Chunk currently audible
        chunk_id: Uuid,
        /// Generation token its completion must carry
        token: u64,
    },
}

/// Snapshot published by the worker after each transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackStatus {
    pub playing: bool,
    pub queued: usize,
}

/// FIFO of audio buffers played strictly one after another
pub struct PlaybackQueue {
    queue: VecDeque<AudioChunk>,
    state: PlaybackState,
    next_token: u64,

    /// `None` when no output device could be opened
    sink: Option<Box<dyn AudioSink>>,
    fallback: Option<Box<dyn SpeechSynthesizer>>,
    on_error: Option<ErrorCallback>,

    /// Where completions of started playbacks are delivered
    completions: Sender<PlaybackEvent>,
}

impl PlaybackQueue {
    pub fn new(sink: Option<Box<dyn AudioSink>>, completions: Sender<PlaybackEvent>) -> Self {
        Self {
            queue: VecDeque::new(),
            state: PlaybackState::Idle,
            next_token: 0,
            sink,
            fallback: None,
            on_error: None,
            completions,
        }
    }

    pub fn with_fallback(mut self, fallback: Box<dyn SpeechSynthesizer>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_error_callback(mut self, on_error: ErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == PlaybackState::Idle
    }

    /// Buffers waiting behind the current one
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn status(&self) -> PlaybackStatus {
        PlaybackStatus {
            playing: !self.is_idle(),
            queued: self.queue.len(),
        }
    }

    /// Apply one event
    pub fn dispatch(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Enqueue(chunk) => {
                debug!("Enqueue {} ({} bytes)", chunk.id, chunk.len());
                self.queue.push_back(chunk);
                self.process();
            }

            PlaybackEvent::Ended { token } => {
                if !self.is_current(token) {
                    debug!("Ignoring stale completion {}", token);
                    return;
                }
                self.state = PlaybackState::Idle;
                self.process();
            }

            PlaybackEvent::Failed { token, error } => {
                if !self.is_current(token) {
                    debug!("Ignoring stale failure {}: {}", token, error);
                    return;
                }
                self.report(&error);
                self.state = PlaybackState::Idle;
                self.process();
            }

            PlaybackEvent::Stop | PlaybackEvent::Shutdown => self.stop(),
        }
    }

    fn is_current(&self, token: u64) -> bool {
        matches!(self.state, PlaybackState::Playing { token: current, .. } if current == token)
    }

    fn stop(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.stop();
        }
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.cancel();
        }

        let dropped = self.queue.len();
        self.queue.clear();
        self.state = PlaybackState::Idle;
        debug!("Playback stopped, {} queued buffers dropped", dropped);
    }

    /// Start the head of the queue when idle
    fn process(&mut self) {
        if !self.is_idle() {
            return;
        }

        while let Some(chunk) = self.queue.pop_front() {
            self.next_token += 1;
            let token = self.next_token;

            let error = match self.start(&chunk, token) {
                Ok(()) => {
                    self.state = PlaybackState::Playing {
                        chunk_id: chunk.id,
                        token,
                    };
                    return;
                }
                Err(e) => e,
            };

            warn!("Playback of {} failed: {}", chunk.id, error);

            // Nothing left to try, no device, or no audio at all: speak the text instead
            let exhausted = self.sink.is_none() || self.queue.is_empty() || chunk.is_empty();
            if exhausted {
                if let Some(text) = chunk.text.clone() {
                    match self.speak_fallback(&text, token) {
                        Ok(true) => {
                            self.state = PlaybackState::Playing {
                                chunk_id: chunk.id,
                                token,
                            };
                            return;
                        }
                        Ok(false) => {}
                        Err(fallback_error) => {
                            self.report(&fallback_error);
                            continue;
                        }
                    }
                }
            }

            self.report(&error);
        }
    }

    fn start(&mut self, chunk: &AudioChunk, token: u64) -> Result<()> {
        if chunk.is_empty() {
            return Err(VoxError::DecodeError("empty audio buffer".to_string()));
        }

        let done = self.completion(token);
        match self.sink.as_mut() {
            Some(sink) => sink.play(&chunk.bytes, done),
            None => Err(VoxError::AudioDeviceError(
                "no audio output device".to_string(),
            )),
        }
    }

    /// `Ok(false)` when there is no fallback to try
    fn speak_fallback(&mut self, text: &str, token: u64) -> Result<bool> {
        let done = self.completion(token);
        match self.fallback.as_mut() {
            Some(fallback) => {
                info!("Falling back to text speech");
                fallback.speak(text, done).map(|_| true)
            }
            None => Ok(false),
        }
    }

    fn completion(&self, token: u64) -> Completion {
        let completions = self.completions.clone();
        Box::new(move |result: Result<()>| {
            let event = match result {
                Ok(()) => PlaybackEvent::Ended { token },
                Err(error) => PlaybackEvent::Failed { token, error },
            };
            let _ = completions.send(event);
        })
    }

    fn report(&self, error: &VoxError) {
        error!("Audio playback error: {}", error);
        if let Some(on_error) = &self.on_error {
            on_error(error);
        }
    }
}

/// Spawns the thread that owns the queue and the output device
pub struct PlaybackWorker;

impl PlaybackWorker {
    /// Start the worker.
    ///
    /// `make_sink` runs on the worker thread, so the sink it builds never
    /// has to cross threads. When it fails the queue runs without a device
    /// and relies on the fallback.
    pub fn spawn<F>(
        make_sink: F,
        fallback: Option<Box<dyn SpeechSynthesizer>>,
        on_error: Option<ErrorCallback>,
    ) -> Result<PlaybackHandle>
    where
        F: FnOnce() -> Result<Box<dyn AudioSink>> + Send + 'static,
    {
        let (event_tx, event_rx) = unbounded();
        let status = Arc::new(RwLock::new(PlaybackStatus::default()));

        let completions = event_tx.clone();
        let shared = Arc::clone(&status);
        thread::Builder::new()
            .name("voxchat-playback".to_string())
            .spawn(move || {
                info!("Playback worker starting");

                let sink = match make_sink() {
                    Ok(sink) => Some(sink),
                    Err(e) => {
                        warn!("No audio output, using text fallback only: {}", e);
                        None
                    }
                };

                let mut queue = PlaybackQueue::new(sink, completions);
                if let Some(fallback) = fallback {
                    queue = queue.with_fallback(fallback);
                }
                if let Some(on_error) = on_error {
                    queue = queue.with_error_callback(on_error);
                }

                run(queue, event_rx, shared);
                info!("Playback worker stopped");
            })
            .map_err(|e| VoxError::AudioDeviceError(format!("Failed to spawn playback thread: {}", e)))?;

        Ok(PlaybackHandle {
            events: event_tx,
            status,
        })
    }
}

fn run(mut queue: PlaybackQueue, events: Receiver<PlaybackEvent>, status: Arc<RwLock<PlaybackStatus>>) {
    while let Ok(event) = events.recv() {
        let shutdown = matches!(event, PlaybackEvent::Shutdown);
        queue.dispatch(event);
        *status.write() = queue.status();
        if shutdown {
            break;
        }
    }
}

/// Cloneable front of a running [`PlaybackWorker`]
#[derive(Clone)]
pub struct PlaybackHandle {
    events: Sender<PlaybackEvent>,
    status: Arc<RwLock<PlaybackStatus>>,
}

impl PlaybackHandle {
    /// Queue a buffer; never blocks
    pub fn enqueue(&self, chunk: AudioChunk) -> Result<Uuid> {
        let id = chunk.id;
        self.send(PlaybackEvent::Enqueue(chunk))?;
        Ok(id)
    }

    /// Queue raw bytes, remembering the text they were made from
    pub fn enqueue_bytes(&self, bytes: impl Into<Bytes>, text: Option<&str>) -> Result<Uuid> {
        let mut chunk = AudioChunk::new(bytes);
        if let Some(text) = text {
            chunk = chunk.with_text(text);
        }
        self.enqueue(chunk)
    }

    pub fn stop(&self) -> Result<()> {
        self.send(PlaybackEvent::Stop)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(PlaybackEvent::Shutdown)
    }

    /// Last published status; lags the most recent command slightly
    pub fn status(&self) -> PlaybackStatus {
        *self.status.read()
    }

    pub fn is_playing(&self) -> bool {
        self.status().playing
    }

    fn send(&self, event: PlaybackEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| VoxError::ChannelError("playback worker is not running".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use parking_lot::Mutex;

    /// Records plays and keeps their completions for the test to fire
    #[derive(Clone, Default)]
    struct FakeSink {
        log: Arc<Mutex<Vec<String>>>,
        pending: Arc<Mutex<Vec<Completion>>>,
    }

    impl AudioSink for FakeSink {
        fn play(&mut self, bytes: &[u8], done: Completion) -> Result<()> {
            if bytes == b"bad" {
                return Err(VoxError::DecodeError("unrecognized format".into()));
            }
            self.log
                .lock()
                .push(format!("play {}", String::from_utf8_lossy(bytes)));
            self.pending.lock().push(done);
            Ok(())
        }

        fn stop(&mut self) {
            self.log.lock().push("stop".into());
            self.pending.lock().clear();
        }
    }

    #[derive(Clone, Default)]
    struct FakeSynth {
        spoken: Arc<Mutex<Vec<String>>>,
    }

    impl SpeechSynthesizer for FakeSynth {
        fn speak(&mut self, text: &str, done: Completion) -> Result<()> {
            self.spoken.lock().push(text.to_string());
            done(Ok(()));
            Ok(())
        }

        fn cancel(&mut self) {}
    }

    struct Harness {
        queue: PlaybackQueue,
        sink: FakeSink,
        completions: Receiver<PlaybackEvent>,
        errors: Arc<Mutex<Vec<ErrorKind>>>,
    }

    impl Harness {
        fn new() -> Self {
            let sink = FakeSink::default();
            let (tx, rx) = unbounded();
            let errors = Arc::new(Mutex::new(Vec::new()));
            let sink_errors = Arc::clone(&errors);
            let queue = PlaybackQueue::new(Some(Box::new(sink.clone())), tx).with_error_callback(
                Arc::new(move |e: &VoxError| {
                    sink_errors
                        .lock()
                        .push(e.kind().unwrap_or(ErrorKind::DecodeError))
                }),
            );
            Self {
                queue,
                sink,
                completions: rx,
                errors,
            }
        }

        fn enqueue(&mut self, bytes: &'static str) {
            self.queue
                .dispatch(PlaybackEvent::Enqueue(AudioChunk::new(bytes.as_bytes())));
        }

        /// Let the current playback end naturally
        fn finish_current(&mut self) {
            let done = self.sink.pending.lock().pop().expect("nothing playing");
            done(Ok(()));
            for event in self.completions.try_iter().collect::<Vec<_>>() {
                self.queue.dispatch(event);
            }
        }

        fn log(&self) -> Vec<String> {
            self.sink.log.lock().clone()
        }
    }

    #[test]
    fn test_enqueues_play_in_order_without_overlap() {
        let mut h = Harness::new();
        h.enqueue("a");
        h.enqueue("b");
        h.enqueue("c");

        // Only the head starts; the rest wait
        assert_eq!(h.log(), vec!["play a"]);
        assert_eq!(h.queue.len(), 2);

        h.finish_current();
        assert_eq!(h.log(), vec!["play a", "play b"]);
        h.finish_current();
        h.finish_current();

        assert_eq!(h.log(), vec!["play a", "play b", "play c"]);
        assert!(h.queue.is_idle());
        assert!(h.queue.is_empty());
    }

    #[test]
    fn test_stop_resets_and_next_enqueue_starts_fresh() {
        let mut h = Harness::new();
        h.enqueue("a");
        h.enqueue("b");
        let stale = match h.queue.state() {
            PlaybackState::Playing { token, .. } => token,
            PlaybackState::Idle => panic!("should be playing"),
        };

        h.queue.dispatch(PlaybackEvent::Stop);
        assert!(h.queue.is_idle());
        assert!(h.queue.is_empty());

        h.enqueue("c");
        assert_eq!(h.log(), vec!["play a", "stop", "play c"]);

        // A completion from before the stop must not advance the new cycle
        h.queue.dispatch(PlaybackEvent::Ended { token: stale });
        assert!(!h.queue.is_idle());
    }

    #[test]
    fn test_stop_when_idle_is_safe() {
        let mut h = Harness::new();
        h.queue.dispatch(PlaybackEvent::Stop);
        h.queue.dispatch(PlaybackEvent::Stop);
        assert!(h.queue.is_idle());
    }

    #[test]
    fn test_decode_error_reports_and_continues() {
        let mut h = Harness::new();
        h.enqueue("a");
        h.enqueue("bad");
        h.enqueue("c");

        h.finish_current();
        assert_eq!(h.log(), vec!["play a", "play c"]);
        assert_eq!(*h.errors.lock(), vec![ErrorKind::DecodeError]);
    }

    #[test]
    fn test_playback_failure_moves_on() {
        let mut h = Harness::new();
        h.enqueue("a");
        h.enqueue("b");

        let done = h.sink.pending.lock().pop().unwrap();
        done(Err(VoxError::DecodeError("truncated".into())));
        for event in h.completions.try_iter().collect::<Vec<_>>() {
            h.queue.dispatch(event);
        }

        assert_eq!(h.log(), vec!["play a", "play b"]);
        assert_eq!(h.errors.lock().len(), 1);
    }

    #[test]
    fn test_last_decode_failure_falls_back_to_text() {
        let synth = FakeSynth::default();
        let mut h = Harness::new();
        h.queue = PlaybackQueue::new(Some(Box::new(h.sink.clone())), unbounded().0)
            .with_fallback(Box::new(synth.clone()));

        h.queue.dispatch(PlaybackEvent::Enqueue(
            AudioChunk::new(&b"bad"[..]).with_text("hello there"),
        ));

        assert_eq!(*synth.spoken.lock(), vec!["hello there"]);
    }

    #[test]
    fn test_text_only_chunk_goes_straight_to_fallback() {
        let synth = FakeSynth::default();
        let mut h = Harness::new();
        h.queue = PlaybackQueue::new(Some(Box::new(h.sink.clone())), unbounded().0)
            .with_fallback(Box::new(synth.clone()));

        h.queue.dispatch(PlaybackEvent::Enqueue(AudioChunk::text_only("hi")));
        h.queue.dispatch(PlaybackEvent::Enqueue(AudioChunk::new(&b"a"[..])));

        assert_eq!(*synth.spoken.lock(), vec!["hi"]);
        assert!(h.log().is_empty());
    }

    #[test]
    fn test_no_device_without_text_surfaces_error() {
        let (tx, _rx) = unbounded();
        let errors = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&errors);
        let mut queue = PlaybackQueue::new(None, tx)
            .with_error_callback(Arc::new(move |_: &VoxError| *counter.lock() += 1));

        queue.dispatch(PlaybackEvent::Enqueue(AudioChunk::new(&b"a"[..])));
        assert!(queue.is_idle());
        assert_eq!(*errors.lock(), 1);
    }

    #[test]
    fn test_no_device_speaks_every_chunk_with_text() {
        let synth = FakeSynth::default();
        let (tx, rx) = unbounded();
        let mut queue = PlaybackQueue::new(None, tx).with_fallback(Box::new(synth.clone()));

        queue.dispatch(PlaybackEvent::Enqueue(
            AudioChunk::new(&b"a"[..]).with_text("one"),
        ));
        queue.dispatch(PlaybackEvent::Enqueue(
            AudioChunk::new(&b"b"[..]).with_text("two"),
        ));
        // The fake finished "one" immediately; deliver it
        for event in rx.try_iter().collect::<Vec<_>>() {
            queue.dispatch(event);
        }

        assert_eq!(*synth.spoken.lock(), vec!["one", "two"]);
    }
}
