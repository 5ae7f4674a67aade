//! Terminal front end

pub mod render;
pub mod repl;

pub use render::{
    format_conversation, format_conversation_list, format_message, format_model_list, LiveReply,
};
pub use repl::{CommandError, Repl, ReplCommand, Step};
