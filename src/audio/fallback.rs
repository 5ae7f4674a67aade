//! Text-driven speech fallback used when buffered audio cannot be played

use crate::audio::sink::Completion;
use crate::{ErrorKind, Result, VoxError};
use parking_lot::Mutex;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Speaks text directly, without an audio buffer
pub trait SpeechSynthesizer: Send {
    /// Start speaking; `done` fires once speech ends
    fn speak(&mut self, text: &str, done: Completion) -> Result<()>;

    /// Interrupt current speech. Safe when silent.
    fn cancel(&mut self);
}

/// Commands probed in order
const CANDIDATES: &[&str] = &["espeak-ng", "espeak", "say"];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shells out to a system speech command
pub struct CommandSynthesizer {
    program: String,
    args: Vec<String>,
    /// Slot of the running command; each `speak` gets a fresh slot
    current: Option<Arc<Mutex<Option<Child>>>>,
}

impl CommandSynthesizer {
    /// Use an explicit program; the text is passed as its last argument
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// First speech command found on `PATH`, if any
    pub fn detect() -> Option<Self> {
        let program = CANDIDATES.iter().find(|name| on_path(name))?;
        info!("Speech fallback: {}", program);
        Some(Self::new(*program))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

fn on_path(program: &str) -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(program).is_file()))
        .unwrap_or(false)
}

impl SpeechSynthesizer for CommandSynthesizer {
    fn speak(&mut self, text: &str, done: Completion) -> Result<()> {
        self.cancel();

        let child = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                VoxError::tts(
                    ErrorKind::UnsupportedCapability,
                    format!("{} failed to start: {}", self.program, e),
                )
            })?;

        debug!("Speaking {} chars with {}", text.len(), self.program);
        let slot = Arc::new(Mutex::new(Some(child)));
        self.current = Some(Arc::clone(&slot));

        thread::spawn(move || loop {
            thread::sleep(POLL_INTERVAL);
            let mut guard = slot.lock();
            let finished = match guard.as_mut() {
                Some(child) => match child.try_wait() {
                    Ok(Some(_)) => true,
                    Ok(None) => false,
                    Err(e) => {
                        warn!("Speech command wait failed: {}", e);
                        true
                    }
                },
                // Cancelled
                None => true,
            };
            if finished {
                guard.take();
                drop(guard);
                done(Ok(()));
                return;
            }
        });

        Ok(())
    }

    fn cancel(&mut self) {
        let Some(slot) = self.current.take() else {
            return;
        };
        let child = slot.lock().take();
        if let Some(mut child) = child {
            let _ = child.kill();
            let _ = child.wait();
            debug!("Speech command cancelled");
        }
    }
}
