//! Local persistence of chat history, drafts and settings

pub mod history;
pub mod store;

pub use history::{draft_key, ChatHistory, ExportFormat, ACTIVE_KEY, CONVERSATIONS_KEY};
pub use store::{get_json, set_json, FileStore, KeyValueStore, MemoryStore};
