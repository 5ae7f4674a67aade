//! Chat backend access and reply aggregation

pub mod aggregator;
pub mod client;
pub mod config;
pub mod context;
pub mod wire;

pub use aggregator::{AggregatorEvent, StreamingAggregator, TurnOutcome};
pub use client::{ChatBackend, FragmentStream, HttpChatClient};
pub use config::{ChatConfig, FragmentMode};
pub use context::{estimate_tokens, ConversationContext};
pub use wire::{ChatReply, ChatRequest, Fragment, HealthStatus, ModelInfo, WireMessage};
