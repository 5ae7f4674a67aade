//! Conversations, the active selection and per-conversation drafts

use crate::messages::{title_from, Conversation, Role};
use crate::storage::store::{get_json, set_json, KeyValueStore};
use crate::{Result, VoxError};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const CONVERSATIONS_KEY: &str = "conversations";
pub const ACTIVE_KEY: &str = "active-conversation";
const DRAFT_PREFIX: &str = "draft:";

pub fn draft_key(conversation_id: &str) -> String {
    format!("{}{}", DRAFT_PREFIX, conversation_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Markdown,
}

impl std::str::FromStr for ExportFormat {
    type Err = VoxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "md" | "markdown" => Ok(ExportFormat::Markdown),
            other => Err(VoxError::ConfigError(format!(
                "unknown export format '{}' (use json or md)",
                other
            ))),
        }
    }
}

/// Persistent chat history over a key-value store
#[derive(Clone)]
pub struct ChatHistory {
    store: Arc<dyn KeyValueStore>,
}

impl ChatHistory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    fn load(&self) -> Result<HashMap<String, Conversation>> {
        Ok(get_json(self.store.as_ref(), CONVERSATIONS_KEY)?.unwrap_or_default())
    }

    fn persist(&self, conversations: &HashMap<String, Conversation>) -> Result<()> {
        set_json(self.store.as_ref(), CONVERSATIONS_KEY, conversations)
    }

    fn missing(id: &str) -> VoxError {
        VoxError::StorageError(format!("no conversation '{}'", id))
    }

    /// Create an empty conversation and make it active
    pub fn create(&self) -> Result<Conversation> {
        let conversation = Conversation::new();
        let mut all = self.load()?;
        all.insert(conversation.id.clone(), conversation.clone());
        self.persist(&all)?;
        self.set_active(&conversation.id)?;
        info!("Created conversation {}", conversation.id);
        Ok(conversation)
    }

    /// All conversations, most recently updated first
    pub fn list(&self) -> Result<Vec<Conversation>> {
        let mut conversations: Vec<_> = self.load()?.into_values().collect();
        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.load()?.remove(id))
    }

    /// Insert or replace a conversation
    pub fn save(&self, conversation: &Conversation) -> Result<()> {
        let mut all = self.load()?;
        all.insert(conversation.id.clone(), conversation.clone());
        self.persist(&all)?;
        debug!(
            "Saved conversation {} ({} messages)",
            conversation.id,
            conversation.messages.len()
        );
        Ok(())
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<Conversation> {
        let mut all = self.load()?;
        let conversation = all.get_mut(id).ok_or_else(|| Self::missing(id))?;
        conversation.title = title_from(title);
        conversation.updated_at = Utc::now();
        let renamed = conversation.clone();
        self.persist(&all)?;
        Ok(renamed)
    }

    /// Remove a conversation and its draft. When it was active, the most
    /// recent remaining conversation becomes active.
    pub fn delete(&self, id: &str) -> Result<()> {
        let mut all = self.load()?;
        if all.remove(id).is_none() {
            return Err(Self::missing(id));
        }
        self.persist(&all)?;
        self.clear_draft(id)?;

        if self.active_id()?.as_deref() == Some(id) {
            let next = all.values().max_by_key(|c| c.updated_at).map(|c| c.id.clone());
            match next {
                Some(next) => self.set_active(&next)?,
                None => self.store.remove(ACTIVE_KEY)?,
            }
        }
        info!("Deleted conversation {}", id);
        Ok(())
    }

    pub fn active_id(&self) -> Result<Option<String>> {
        get_json(self.store.as_ref(), ACTIVE_KEY)
    }

    fn set_active(&self, id: &str) -> Result<()> {
        set_json(self.store.as_ref(), ACTIVE_KEY, id)
    }

    /// Make `id` the active conversation
    pub fn switch(&self, id: &str) -> Result<Conversation> {
        let conversation = self.get(id)?.ok_or_else(|| Self::missing(id))?;
        self.set_active(id)?;
        Ok(conversation)
    }

    /// The active conversation, creating one when there is none
    pub fn active_or_create(&self) -> Result<Conversation> {
        if let Some(id) = self.active_id()? {
            if let Some(conversation) = self.get(&id)? {
                return Ok(conversation);
            }
        }
        self.create()
    }

    pub fn draft(&self, conversation_id: &str) -> Result<Option<String>> {
        get_json(self.store.as_ref(), &draft_key(conversation_id))
    }

    /// Store a draft; blank text clears it
    pub fn set_draft(&self, conversation_id: &str, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return self.clear_draft(conversation_id);
        }
        set_json(self.store.as_ref(), &draft_key(conversation_id), text)
    }

    pub fn clear_draft(&self, conversation_id: &str) -> Result<()> {
        self.store.remove(&draft_key(conversation_id))
    }

    pub fn export(&self, id: &str, format: ExportFormat) -> Result<String> {
        let conversation = self.get(id)?.ok_or_else(|| Self::missing(id))?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&conversation)?),
            ExportFormat::Markdown => Ok(to_markdown(&conversation)),
        }
    }
}

fn to_markdown(conversation: &Conversation) -> String {
    let mut out = format!(
        "# {}\n\n_Created {}_\n",
        conversation.title,
        conversation.created_at.format("%Y-%m-%d %H:%M UTC")
    );

    for message in &conversation.messages {
        let speaker = match message.role {
            Role::User => "You",
            Role::Assistant => "Assistant",
            Role::System => "System",
        };
        out.push_str(&format!(
            "\n**{}** ({}):\n\n{}\n",
            speaker,
            message.timestamp.format("%H:%M"),
            message.content.trim()
        ));
        if let Some(error) = &message.error {
            out.push_str(&format!("\n> Error ({}): {}\n", error.kind, error.user_message()));
        }
    }
    out
}
