//! Top-level error types for Tara.

use std::sync::Arc;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        source: Arc<std::io::Error>,
    },

    #[error("failed to parse config from {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("missing API key for provider: {0}")]
    MissingProviderKey(String),

    #[error("provider request failed: {0}")]
    ProviderRequest(String),

    #[error("provider returned status {status}: {message}")]
    ProviderStatus { status: u16, message: String },

    #[error("completion failed: {0}")]
    CompletionFailed(String),

    #[error("model returned an empty reply")]
    EmptyReply,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Messaging adapter and delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("no messaging adapter named '{0}'")]
    UnknownAdapter(String),

    #[error("missing {key} in message metadata")]
    MissingMetadata { key: String },

    #[error("failed to download media: {0}")]
    MediaDownload(String),

    #[error("delivery stopped after {delivered} of {total} fragments: {source}")]
    DeliveryFailed {
        delivered: usize,
        total: usize,
        source: Box<Error>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
