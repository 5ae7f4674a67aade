//! Output device seam
//!
//! A sink plays one encoded buffer at a time and reports its end through a
//! [`Completion`]. The rodio-backed sink is only built with `audio-io`.

use crate::Result;

/// Called exactly once when a started playback ends, naturally or with an error
pub type Completion = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Something that can play encoded audio
pub trait AudioSink {
    /// Decode `bytes` and start playing them.
    ///
    /// Returns an error (and never calls `done`) when the bytes cannot be
    /// decoded or the device refuses them.
    fn play(&mut self, bytes: &[u8], done: Completion) -> Result<()>;

    /// Halt current playback. Safe when nothing is playing.
    fn stop(&mut self);
}

#[cfg(feature = "audio-io")]
pub use self::rodio_sink::{decode, RodioSink};

#[cfg(feature = "audio-io")]
mod rodio_sink {
    use super::{AudioSink, Completion};
    use crate::{Result, VoxError};
    use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};
    use std::io::Cursor;
    use std::sync::Arc;
    use std::thread;
    use tracing::{debug, info};

    /// Decode an in-memory buffer with whatever format rodio recognizes
    pub fn decode(bytes: &[u8]) -> Result<Decoder<Cursor<Vec<u8>>>> {
        Decoder::new(Cursor::new(bytes.to_vec())).map_err(|e| VoxError::DecodeError(e.to_string()))
    }

    /// Plays through the default output device.
    ///
    /// Holds the `OutputStream`, so it must stay on the thread that made it.
    pub struct RodioSink {
        _stream: OutputStream,
        handle: OutputStreamHandle,
        current: Option<Arc<Sink>>,
    }

    impl RodioSink {
        pub fn try_default() -> Result<Self> {
            let (stream, handle) = OutputStream::try_default()
                .map_err(|e| VoxError::AudioDeviceError(format!("No output device: {}", e)))?;

            info!("Audio output opened");
            Ok(Self {
                _stream: stream,
                handle,
                current: None,
            })
        }
    }

    impl AudioSink for RodioSink {
        fn play(&mut self, bytes: &[u8], done: Completion) -> Result<()> {
            let source = decode(bytes)?;
            let sink = Sink::try_new(&self.handle)
                .map_err(|e| VoxError::AudioDeviceError(format!("Failed to open sink: {}", e)))?;
            sink.append(source);

            let sink = Arc::new(sink);
            let watcher = Arc::clone(&sink);
            thread::spawn(move || {
                watcher.sleep_until_end();
                done(Ok(()));
            });

            debug!("Playing {} bytes", bytes.len());
            self.current = Some(sink);
            Ok(())
        }

        fn stop(&mut self) {
            if let Some(sink) = self.current.take() {
                sink.stop();
            }
        }
    }
}
