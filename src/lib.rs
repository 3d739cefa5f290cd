//! Tara: a persona-driven chat assistant served over a terminal, Telegram, and WhatsApp.

pub mod agent;
pub mod chunk;
pub mod coalesce;
pub mod config;
pub mod conversation;
pub mod error;
pub mod llm;
pub mod logging;
pub mod messaging;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable identifier of a message sender, scoped by platform (e.g. `telegram:42`).
pub type UserId = String;

/// Inbound message from any messaging platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub source: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: MessageContent,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl InboundMessage {
    /// Build a plain text message with no platform metadata.
    pub fn text(
        source: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let sender_id = sender_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: format!("{source}:{sender_id}"),
            source,
            sender_id,
            content: MessageContent::Text(text.into()),
            timestamp: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Key used to group messages from one person for coalescing and history.
    pub fn user_key(&self) -> UserId {
        format!("{}:{}", self.source, self.sender_id)
    }
}

/// Message content variants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageContent {
    Text(String),
    Media {
        text: Option<String>,
        attachments: Vec<Attachment>,
    },
}

impl MessageContent {
    /// Wrap downloaded attachments, dropping the media variant when nothing survived.
    pub fn from_parts(text: Option<String>, attachments: Vec<Attachment>) -> Self {
        if attachments.is_empty() {
            MessageContent::Text(text.unwrap_or_default())
        } else {
            MessageContent::Media { text, attachments }
        }
    }

    /// The text handed to the agent for this message.
    ///
    /// Media without a caption gets an instruction matching its kind, so the
    /// agent always has something to respond to.
    pub fn prompt_text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Media { text, attachments } => match text {
                Some(text) if !text.trim().is_empty() => text.clone(),
                _ => attachments
                    .first()
                    .map(|attachment| attachment.kind().default_prompt().to_string())
                    .unwrap_or_default(),
            },
        }
    }

    pub fn attachments(&self) -> &[Attachment] {
        match self {
            MessageContent::Text(_) => &[],
            MessageContent::Media { attachments, .. } => attachments,
        }
    }
}

impl std::fmt::Display for MessageContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageContent::Text(text) => write!(f, "{}", text),
            MessageContent::Media { text, .. } => {
                if let Some(t) = text {
                    write!(f, "{}", t)
                } else {
                    write!(f, "[media]")
                }
            }
        }
    }
}

/// A downloaded file attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn kind(&self) -> MediaKind {
        MediaKind::from_mime(&self.mime_type)
    }
}

/// Broad media classification used for default prompts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Audio,
    Video,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime_type: &str) -> Self {
        match mime_type.split('/').next().unwrap_or_default() {
            "image" => MediaKind::Image,
            "audio" => MediaKind::Audio,
            "video" => MediaKind::Video,
            _ => MediaKind::Document,
        }
    }

    pub fn default_prompt(self) -> &'static str {
        match self {
            MediaKind::Image => "Please analyze this image and provide relevant financial advice.",
            MediaKind::Audio => "Please transcribe and respond to this audio message.",
            MediaKind::Video => "Please analyze this video and provide relevant financial advice.",
            MediaKind::Document => {
                "Please analyze this document and provide relevant financial advice."
            }
        }
    }
}

/// Outbound response to messaging platforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundResponse {
    Text(String),
}

/// Serde helper for encoding `Vec<u8>` as base64 in JSON.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&s)
            .map_err(serde::de::Error::custom)
    }
}

/// Status updates for messaging platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusUpdate {
    Thinking,
    /// Cancel the typing indicator.
    StopTyping,
}
