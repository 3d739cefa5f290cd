//! Conversation history.

pub mod history;

pub use history::{ConversationHistory, Exchange};
