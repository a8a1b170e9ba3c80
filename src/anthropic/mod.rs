//! Messages API client and the model-backed pipeline components built on it.

pub mod agent;
pub mod client;
pub mod error;
pub mod types;

pub use agent::{AnthropicAgent, AnthropicSynthesizer};
pub use client::{API_URL, AnthropicClient, MessageSender};
pub use error::AnthropicError;
pub use types::{ContentBlock, Message, MessagesRequest, MessagesResponse, Usage};
