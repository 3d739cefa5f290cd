//! LLM provider client.

pub mod gemini;

pub use gemini::{CompletionRequest, GeminiClient};
