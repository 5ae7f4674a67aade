//! Application state: the active conversation, settings, backend and speech
//!
//! [`ChatSession`] is shared behind an `Arc`; every operation takes `&self`
//! so a cancel can arrive while a send is still awaiting the backend.

use crate::chat::{
    AggregatorEvent, ChatBackend, ConversationContext, ModelInfo, StreamingAggregator, TurnOutcome,
};
use crate::integration::settings::SettingsStore;
use crate::messages::{ChatMessage, Conversation, MessageStorage};
use crate::speech::{
    RecognitionEvent, RecognitionMachine, RecognitionOutput, Speaker, SpeechRecognizer,
};
use crate::storage::ChatHistory;
use crate::{Result, VoxError};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Active conversation plus the aggregator bound to its message list
struct Active {
    conversation: Conversation,
    aggregator: StreamingAggregator,
}

pub struct ChatSession {
    settings: SettingsStore,
    history: ChatHistory,
    backend: Arc<dyn ChatBackend>,
    events: Option<Sender<AggregatorEvent>>,
    active: RwLock<Active>,
    speaker: Option<Speaker>,
    voice_input: Mutex<RecognitionMachine>,
}

impl ChatSession {
    /// Open the active conversation (creating one if needed)
    pub fn new(
        settings: SettingsStore,
        history: ChatHistory,
        backend: Arc<dyn ChatBackend>,
    ) -> Result<Self> {
        let conversation = history.active_or_create()?;
        let aggregator = Self::bind(&backend, None, &conversation);
        info!(
            "Session opened on conversation {} ({} messages)",
            conversation.id,
            conversation.messages.len()
        );

        Ok(Self {
            settings,
            history,
            backend,
            events: None,
            active: RwLock::new(Active {
                conversation,
                aggregator,
            }),
            speaker: None,
            voice_input: Mutex::new(RecognitionMachine::unsupported()),
        })
    }

    /// Publish aggregator events on `events`
    pub fn with_events(mut self, events: Sender<AggregatorEvent>) -> Self {
        self.events = Some(events);
        let active = self.active.get_mut();
        active.aggregator = Self::bind(&self.backend, self.events.clone(), &active.conversation);
        self
    }

    pub fn with_speaker(mut self, speaker: Speaker) -> Self {
        self.speaker = Some(speaker);
        self
    }

    pub fn with_recognizer(mut self, recognizer: Box<dyn SpeechRecognizer>) -> Self {
        self.voice_input = Mutex::new(RecognitionMachine::new(Some(recognizer)));
        self
    }

    /// Aggregator over a conversation's messages. A reply left generating by
    /// an earlier process can never finish, so it is unstuck here.
    fn bind(
        backend: &Arc<dyn ChatBackend>,
        events: Option<Sender<AggregatorEvent>>,
        conversation: &Conversation,
    ) -> StreamingAggregator {
        let messages = conversation
            .messages
            .iter()
            .cloned()
            .map(|mut m| {
                m.is_generating = false;
                m
            })
            .collect();

        let aggregator = StreamingAggregator::new(Arc::clone(backend), MessageStorage::from_messages(messages));
        match events {
            Some(events) => aggregator.with_events(events),
            None => aggregator,
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn history(&self) -> &ChatHistory {
        &self.history
    }

    pub fn speaker(&self) -> Option<&Speaker> {
        self.speaker.as_ref()
    }

    /// The active conversation with its current messages
    pub fn conversation(&self) -> Conversation {
        let active = self.active.read();
        let mut conversation = active.conversation.clone();
        conversation.messages = active.aggregator.storage().get_all();
        conversation
    }

    pub fn conversation_id(&self) -> String {
        self.active.read().conversation.id.clone()
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.active.read().aggregator.storage().get_all()
    }

    pub fn is_generating(&self) -> bool {
        self.active.read().aggregator.is_generating()
    }

    /// Send a user message and wait for the turn to end.
    ///
    /// A send while a reply is generating is ignored. Failures of the turn
    /// itself are recorded on the message, not returned.
    pub async fn send(&self, text: &str) -> Result<TurnOutcome> {
        let settings = self.settings.snapshot();
        let config = settings.chat_config();
        let context = ConversationContext::new(settings.system_prompt.clone(), config.context_size);

        let (aggregator, conversation_id) = {
            let active = self.active.read();
            (
                active
                    .aggregator
                    .clone()
                    .with_fragment_mode(settings.fragment_mode),
                active.conversation.id.clone(),
            )
        };

        let outcome = aggregator
            .send(text, |history| context.build_request(&config, history))
            .await;

        match &outcome {
            TurnOutcome::Ignored => return Ok(outcome),
            TurnOutcome::Discarded => {
                debug!("Turn discarded, nothing to persist");
                return Ok(outcome);
            }
            _ => {}
        }

        self.persist_turn(&aggregator)?;
        self.history.clear_draft(&conversation_id)?;

        if let (TurnOutcome::Completed(message), Some(speaker)) = (&outcome, &self.speaker) {
            speaker.set_settings(settings.tts.clone());
            if let Err(e) = speaker.auto_speak(message).await {
                warn!("Auto-speak failed: {}", e);
            }
        }

        Ok(outcome)
    }

    /// Stop the running turn, keeping what arrived. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        self.active.read().aggregator.cancel()
    }

    /// Save a finished turn if its conversation is still open.
    ///
    /// Leaving a conversation cancels its turn, which finalizes the reply in
    /// place, and then saves it; a turn that ends afterwards is already stored.
    fn persist_turn(&self, aggregator: &StreamingAggregator) -> Result<()> {
        let mut active = self.active.write();
        if !active.aggregator.storage().shares(aggregator.storage()) {
            debug!("Turn ended after its conversation was closed");
            return Ok(());
        }
        let messages = active.aggregator.storage().get_all();
        active.conversation.set_messages(messages);
        self.history.save(&active.conversation)
    }

    fn persist(&self) -> Result<()> {
        let mut active = self.active.write();
        let messages = active.aggregator.storage().get_all();
        active.conversation.set_messages(messages);
        self.history.save(&active.conversation)
    }

    fn activate(&self, conversation: Conversation) {
        let aggregator = Self::bind(&self.backend, self.events.clone(), &conversation);
        info!("Active conversation: {}", conversation.id);
        *self.active.write() = Active {
            conversation,
            aggregator,
        };
    }

    pub fn new_conversation(&self) -> Result<Conversation> {
        self.cancel();
        self.persist()?;
        let conversation = self.history.create()?;
        self.activate(conversation.clone());
        Ok(conversation)
    }

    pub fn switch(&self, id: &str) -> Result<Conversation> {
        self.cancel();
        self.persist()?;
        let conversation = self.history.switch(id)?;
        self.activate(conversation.clone());
        Ok(conversation)
    }

    /// Remove every message of the active conversation
    pub fn clear_conversation(&self) -> Result<()> {
        self.cancel();
        self.active.read().aggregator.storage().clear();
        self.persist()
    }

    /// Fetch the model list; when the selected model is not offered, switch
    /// to the first one that is
    pub async fn refresh_models(&self) -> Result<Vec<ModelInfo>> {
        let models = self.backend.list_models().await?;
        let current = self.settings.snapshot().model.clone();

        if !models.is_empty() && !models.iter().any(|m| m.name == current) {
            let first = models[0].name.clone();
            info!("Model {} not available, selecting {}", current, first);
            self.settings.update(|s| s.model = first)?;
        }
        Ok(models)
    }

    pub fn set_model(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            return Err(VoxError::ConfigError("model must not be empty".into()));
        }
        self.settings.update(|s| s.model = model.to_string())?;
        info!("Model set to {}", model);
        Ok(())
    }

    pub fn draft(&self) -> Result<Option<String>> {
        self.history.draft(&self.conversation_id())
    }

    pub fn set_draft(&self, text: &str) -> Result<()> {
        self.history.set_draft(&self.conversation_id(), text)
    }

    /// Speak `text`, or the last finished assistant reply when `None`
    pub async fn speak(&self, text: Option<&str>) -> Result<()> {
        let speaker = self.speaker.as_ref().ok_or_else(|| {
            VoxError::tts(
                crate::ErrorKind::UnsupportedCapability,
                "speech output is not configured",
            )
        })?;

        let text = match text {
            Some(text) => text.to_string(),
            None => self
                .messages()
                .iter()
                .rev()
                .find(|m| m.role == crate::messages::Role::Assistant && !m.is_generating)
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        };
        speaker.set_settings(self.settings.snapshot().tts.clone());
        speaker.speak(&text).await
    }

    pub fn stop_speaking(&self) -> Result<()> {
        match &self.speaker {
            Some(speaker) => speaker.stop(),
            None => Ok(()),
        }
    }

    /// Feed the voice input machine
    pub fn voice_event(&self, event: RecognitionEvent) -> Option<RecognitionOutput> {
        self.voice_input.lock().dispatch(event)
    }

    pub fn is_listening(&self) -> bool {
        self.voice_input.lock().is_listening()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::{ChatReply, ChatRequest, FragmentStream};
    use crate::storage::MemoryStore;
    use async_trait::async_trait;

    struct EchoBackend {
        models: Vec<&'static str>,
    }

    #[async_trait]
    impl ChatBackend for EchoBackend {
        async fn chat(&self, request: &ChatRequest) -> Result<ChatReply> {
            let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
            Ok(ChatReply {
                id: None,
                content: format!("echo: {}", last),
            })
        }

        async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream> {
            let reply = self.chat(request).await?;
            Ok(Box::pin(futures::stream::iter(vec![Ok(
                crate::chat::Fragment::done(Some(reply.content)),
            )])))
        }

        async fn list_models(&self) -> Result<Vec<ModelInfo>> {
            Ok(self
                .models
                .iter()
                .map(|name| ModelInfo {
                    name: name.to_string(),
                    modified_at: None,
                    size: None,
                })
                .collect())
        }
    }

    fn session(models: Vec<&'static str>) -> ChatSession {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let settings = SettingsStore::load(store.clone()).unwrap();
        let history = ChatHistory::new(store);
        ChatSession::new(settings, history, Arc::new(EchoBackend { models })).unwrap()
    }

    #[tokio::test]
    async fn test_send_persists_turn() {
        let session = session(vec![]);
        session.set_draft("half typed").unwrap();

        let outcome = session.send("hello").await.unwrap();
        assert_eq!(outcome.message().unwrap().content, "echo: hello");

        let saved = session
            .history()
            .get(&session.conversation_id())
            .unwrap()
            .unwrap();
        assert_eq!(saved.messages.len(), 2);
        assert_eq!(saved.title, "hello");
        assert_eq!(session.draft().unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_models_selects_first_available() {
        let session = session(vec!["llama3:8b", "gemma3:1b"]);
        session.refresh_models().await.unwrap();
        assert_eq!(session.settings().snapshot().model, "llama3:8b");

        session.set_model("gemma3:1b").unwrap();
        session.refresh_models().await.unwrap();
        assert_eq!(session.settings().snapshot().model, "gemma3:1b");
    }

    #[tokio::test]
    async fn test_new_conversation_and_switch_back() {
        let session = session(vec![]);
        session.send("first").await.unwrap();
        let first_id = session.conversation_id();

        let second = session.new_conversation().unwrap();
        assert!(session.messages().is_empty());
        assert_ne!(second.id, first_id);

        let back = session.switch(&first_id).unwrap();
        assert_eq!(back.messages.len(), 2);
        assert_eq!(session.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_clear_conversation() {
        let session = session(vec![]);
        session.send("hi").await.unwrap();
        session.clear_conversation().unwrap();

        assert!(session.messages().is_empty());
        let saved = session
            .history()
            .get(&session.conversation_id())
            .unwrap()
            .unwrap();
        assert!(saved.messages.is_empty());
    }

    #[test]
    fn test_stale_generating_flag_is_cleared_on_open() {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let history = ChatHistory::new(store.clone());
        let mut conversation = history.create().unwrap();
        conversation.set_messages(vec![ChatMessage::user("hi"), ChatMessage::placeholder()]);
        history.save(&conversation).unwrap();

        let settings = SettingsStore::load(store).unwrap();
        let session =
            ChatSession::new(settings, history, Arc::new(EchoBackend { models: vec![] })).unwrap();
        assert!(!session.is_generating());
    }

    #[test]
    fn test_voice_input_without_engine_is_unsupported() {
        let session = session(vec![]);
        let out = session.voice_event(RecognitionEvent::Toggle);
        assert!(matches!(out, Some(RecognitionOutput::Error(_))));
        assert!(!session.is_listening());
    }

    struct SilentRecognizer;

    impl SpeechRecognizer for SilentRecognizer {
        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) {}
    }

    #[test]
    fn test_voice_input_yields_transcript() {
        let session = session(vec![]).with_recognizer(Box::new(SilentRecognizer));
        assert!(session.voice_event(RecognitionEvent::Toggle).is_none());
        assert!(session.is_listening());

        let out = session.voice_event(RecognitionEvent::Result {
            transcript: "what time is it".into(),
            is_final: true,
        });
        assert!(matches!(out, Some(RecognitionOutput::Transcript(t)) if t == "what time is it"));
        assert!(!session.is_listening());
    }

    #[tokio::test]
    async fn test_speak_without_speaker_is_unsupported() {
        let session = session(vec![]);
        let err = session.speak(Some("hi")).await.unwrap_err();
        assert_eq!(err.kind(), Some(crate::ErrorKind::UnsupportedCapability));
    }
}
