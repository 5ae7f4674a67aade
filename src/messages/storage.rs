use super::types::ChatMessage;
use parking_lot::RwLock;
use std::sync::Arc;

/// Thread-safe message list of one conversation.
///
/// Cloning shares the list. The turn helpers enforce that at most one
/// message is generating at any time.
#[derive(Debug, Clone)]
pub struct MessageStorage {
    messages: Arc<RwLock<Vec<ChatMessage>>>,
}

impl MessageStorage {
    pub fn new() -> Self {
        Self::from_messages(Vec::new())
    }

    pub fn from_messages(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages: Arc::new(RwLock::new(messages)),
        }
    }

    /// Whether both handles refer to the same list
    pub fn shares(&self, other: &MessageStorage) -> bool {
        Arc::ptr_eq(&self.messages, &other.messages)
    }

    pub fn add(&self, message: ChatMessage) {
        self.messages.write().push(message);
    }

    pub fn get_all(&self) -> Vec<ChatMessage> {
        self.messages.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ChatMessage> {
        self.messages.read().iter().find(|m| m.id == id).cloned()
    }

    pub fn last(&self) -> Option<ChatMessage> {
        self.messages.read().last().cloned()
    }

    pub fn clear(&self) {
        self.messages.write().clear();
    }

    pub fn replace_all(&self, messages: Vec<ChatMessage>) {
        *self.messages.write() = messages;
    }

    pub fn len(&self) -> usize {
        self.messages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.read().is_empty()
    }

    pub fn is_generating(&self) -> bool {
        self.messages.read().iter().any(|m| m.is_generating)
    }

    /// Append a user message and an assistant placeholder in one step.
    ///
    /// Returns `None` and leaves the list untouched while another reply is
    /// generating. Otherwise returns the history up to and including the user
    /// message, plus the placeholder id.
    pub fn begin_turn(
        &self,
        user: ChatMessage,
        placeholder: ChatMessage,
    ) -> Option<(Vec<ChatMessage>, String)> {
        let mut messages = self.messages.write();
        if messages.iter().any(|m| m.is_generating) {
            return None;
        }

        messages.push(user);
        let history = messages.clone();
        let id = placeholder.id.clone();
        messages.push(placeholder);
        Some((history, id))
    }

    /// Mutate the message with the given id in place.
    ///
    /// Returns `false` when the message no longer exists (for example after
    /// the conversation was cleared mid-generation).
    pub fn update<F>(&self, id: &str, f: F) -> bool
    where
        F: FnOnce(&mut ChatMessage),
    {
        let mut messages = self.messages.write();
        match messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }
}

impl Default for MessageStorage {
    fn default() -> Self {
        Self::new()
    }
}
