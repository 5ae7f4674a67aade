pub mod storage;
pub mod types;

pub use storage::MessageStorage;
pub use types::{title_from, ChatMessage, Conversation, MessageError, Role, TEMP_ID_PREFIX};
