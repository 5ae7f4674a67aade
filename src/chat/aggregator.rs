//! Streaming response aggregator
//!
//! Drives one chat turn at a time against a [`ChatBackend`]: appends the user
//! message and an assistant placeholder, folds reply fragments into the
//! placeholder as they arrive, and republishes every change as an
//! [`AggregatorEvent`]. A turn ends in exactly one of three ways: completed,
//! failed (error attached to the message), or cancelled by the user.

use crate::chat::client::ChatBackend;
use crate::chat::config::FragmentMode;
use crate::chat::wire::{ChatReply, ChatRequest};
use crate::messages::{ChatMessage, MessageError, MessageStorage};
use crate::{ErrorKind, Result, VoxError};
use crossbeam_channel::Sender;
use futures::future::{AbortHandle, Abortable};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Changes to the in-progress assistant message
#[derive(Debug, Clone, PartialEq)]
pub enum AggregatorEvent {
    /// A turn began; the placeholder is in the list
    Started {
        /// Temporary id of the placeholder
        message_id: String,
    },

    /// The placeholder's content changed
    Updated {
        /// Temporary id of the placeholder
        message_id: String,
        /// Full content so far
        content: String,
    },

    /// The reply finished and received its permanent id
    Completed {
        placeholder_id: String,
        message: ChatMessage,
    },

    /// The reply failed; the message carries the error
    Failed {
        placeholder_id: String,
        message: ChatMessage,
    },

    /// The user cancelled; the message keeps what had arrived
    Cancelled {
        placeholder_id: String,
        message: ChatMessage,
    },
}

/// How a call to [`StreamingAggregator::send`] ended
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// Empty input, or a reply was already generating; nothing changed
    Ignored,
    Completed(ChatMessage),
    Failed(ChatMessage),
    Cancelled(ChatMessage),
    /// The placeholder was removed (conversation cleared) before the end
    Discarded,
}

impl TurnOutcome {
    /// The final assistant message, if the turn produced one
    pub fn message(&self) -> Option<&ChatMessage> {
        match self {
            TurnOutcome::Completed(m) | TurnOutcome::Failed(m) | TurnOutcome::Cancelled(m) => {
                Some(m)
            }
            TurnOutcome::Ignored | TurnOutcome::Discarded => None,
        }
    }
}

/// The running turn, as seen by `cancel`
struct ActiveTurn {
    abort: AbortHandle,
    placeholder_id: String,
    /// Filled by `cancel` once it has finalized the placeholder
    settled: Arc<Mutex<Option<TurnOutcome>>>,
}

/// Aggregates backend replies into one conversation's message list.
///
/// Cloning shares the backend, the message list and the cancel slot.
#[derive(Clone)]
pub struct StreamingAggregator {
    backend: Arc<dyn ChatBackend>,
    storage: MessageStorage,
    mode: FragmentMode,
    events: Option<Sender<AggregatorEvent>>,
    active: Arc<Mutex<Option<ActiveTurn>>>,
}

impl StreamingAggregator {
    pub fn new(backend: Arc<dyn ChatBackend>, storage: MessageStorage) -> Self {
        Self {
            backend,
            storage,
            mode: FragmentMode::default(),
            events: None,
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_fragment_mode(mut self, mode: FragmentMode) -> Self {
        self.mode = mode;
        self
    }

    /// Publish every state change on this channel
    pub fn with_events(mut self, events: Sender<AggregatorEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn storage(&self) -> &MessageStorage {
        &self.storage
    }

    pub fn fragment_mode(&self) -> FragmentMode {
        self.mode
    }

    pub fn is_generating(&self) -> bool {
        self.storage.is_generating()
    }

    /// Run one turn.
    ///
    /// `build` receives the history including the new user message and
    /// returns the request to issue; `request.stream` selects the path.
    pub async fn send<F>(&self, content: &str, build: F) -> TurnOutcome
    where
        F: FnOnce(&[ChatMessage]) -> ChatRequest,
    {
        let text = content.trim();
        if text.is_empty() {
            return TurnOutcome::Ignored;
        }

        let (abort, registration) = AbortHandle::new_pair();
        let settled = Arc::new(Mutex::new(None));
        let started = {
            let mut active = self.active.lock();
            let started = self
                .storage
                .begin_turn(ChatMessage::user(text), ChatMessage::placeholder());
            if let Some((_, placeholder_id)) = &started {
                *active = Some(ActiveTurn {
                    abort,
                    placeholder_id: placeholder_id.clone(),
                    settled: Arc::clone(&settled),
                });
            }
            started
        };

        let Some((history, placeholder_id)) = started else {
            debug!("Send ignored: a reply is already generating");
            return TurnOutcome::Ignored;
        };

        let request = build(&history);
        info!(
            "Turn started: model={} stream={} messages={}",
            request.model,
            request.stream,
            request.messages.len()
        );
        self.publish(AggregatorEvent::Started {
            message_id: placeholder_id.clone(),
        });

        let result = Abortable::new(self.run_turn(&request, &placeholder_id), registration).await;

        // Finalize under the slot lock so `cancel` never sees a turn that is
        // neither running nor finished
        let mut active = self.active.lock();
        if active.take().is_none() {
            let outcome = settled.lock().take();
            return outcome.unwrap_or(TurnOutcome::Discarded);
        }
        match result {
            Ok(Ok(reply)) => self.complete(&placeholder_id, reply),
            Ok(Err(e)) => self.fail(&placeholder_id, e),
            Err(_aborted) => self.cancelled(&placeholder_id),
        }
    }

    /// Stop the running turn, if any. Returns whether one was running.
    ///
    /// The placeholder is finalized before this returns, so the message list
    /// can be saved right away.
    pub fn cancel(&self) -> bool {
        let mut active = self.active.lock();
        let Some(turn) = active.take() else {
            return false;
        };
        turn.abort.abort();
        info!("Turn cancelled by user");
        let outcome = self.cancelled(&turn.placeholder_id);
        *turn.settled.lock() = Some(outcome);
        true
    }

    async fn run_turn(&self, request: &ChatRequest, placeholder_id: &str) -> Result<ChatReply> {
        if !request.stream {
            return self.backend.chat(request).await;
        }

        let mut fragments = self.backend.stream_chat(request).await?;
        let mut content = String::new();
        let mut reply_id = None;

        while let Some(fragment) = fragments.next().await {
            let fragment = fragment?;
            if fragment.id.is_some() {
                reply_id = fragment.id.clone();
            }

            if let Some(text) = fragment.content.as_deref() {
                let changed = match self.mode {
                    // An empty terminal fragment keeps the last content
                    FragmentMode::Cumulative if fragment.done && text.is_empty() => false,
                    FragmentMode::Cumulative => {
                        content.clear();
                        content.push_str(text);
                        true
                    }
                    FragmentMode::Delta => {
                        content.push_str(text);
                        !text.is_empty()
                    }
                };
                if changed {
                    self.apply(placeholder_id, &content);
                }
            }

            if fragment.done {
                debug!("Stream done after {} chars", content.len());
                return Ok(ChatReply {
                    id: reply_id,
                    content,
                });
            }
        }

        Err(VoxError::chat(
            ErrorKind::MalformedResponse,
            "stream ended before completion",
        ))
    }

    fn apply(&self, placeholder_id: &str, content: &str) {
        let found = self.storage.update(placeholder_id, |m| {
            m.content = content.to_string();
        });
        if !found {
            debug!("Placeholder {} gone, dropping fragment", placeholder_id);
            return;
        }
        self.publish(AggregatorEvent::Updated {
            message_id: placeholder_id.to_string(),
            content: content.to_string(),
        });
    }

    fn complete(&self, placeholder_id: &str, reply: ChatReply) -> TurnOutcome {
        let id = reply
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(permanent_id);
        let finished = self.finalize(placeholder_id, |m| {
            m.id = id;
            m.content = reply.content;
        });

        match finished {
            Some(message) => {
                info!("Turn completed: {} ({} chars)", message.id, message.content.len());
                self.publish(AggregatorEvent::Completed {
                    placeholder_id: placeholder_id.to_string(),
                    message: message.clone(),
                });
                TurnOutcome::Completed(message)
            }
            None => TurnOutcome::Discarded,
        }
    }

    fn fail(&self, placeholder_id: &str, error: VoxError) -> TurnOutcome {
        let kind = error.kind().unwrap_or(ErrorKind::UpstreamError);
        warn!("Turn failed ({}): {}", kind, error);

        let finished = self.finalize(placeholder_id, |m| {
            m.id = permanent_id();
            if m.content.is_empty() {
                m.content = kind.user_message().to_string();
            }
            m.error = Some(MessageError::new(kind, error.to_string()));
        });

        match finished {
            Some(message) => {
                self.publish(AggregatorEvent::Failed {
                    placeholder_id: placeholder_id.to_string(),
                    message: message.clone(),
                });
                TurnOutcome::Failed(message)
            }
            None => TurnOutcome::Discarded,
        }
    }

    fn cancelled(&self, placeholder_id: &str) -> TurnOutcome {
        let finished = self.finalize(placeholder_id, |m| {
            m.id = permanent_id();
        });

        match finished {
            Some(message) => {
                self.publish(AggregatorEvent::Cancelled {
                    placeholder_id: placeholder_id.to_string(),
                    message: message.clone(),
                });
                TurnOutcome::Cancelled(message)
            }
            None => TurnOutcome::Discarded,
        }
    }

    /// Apply the final mutation, clear the generating flag, return the result
    fn finalize<F>(&self, placeholder_id: &str, f: F) -> Option<ChatMessage>
    where
        F: FnOnce(&mut ChatMessage),
    {
        let mut finished = None;
        self.storage.update(placeholder_id, |m| {
            f(m);
            m.is_generating = false;
            finished = Some(m.clone());
        });
        finished
    }

    fn publish(&self, event: AggregatorEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

fn permanent_id() -> String {
    format!("msg-{}", Uuid::new_v4())
}
