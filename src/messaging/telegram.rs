//! Telegram messaging adapter using teloxide long polling.

use crate::chunk::split_oversized;
use crate::config::TelegramConfig;
use crate::error::{MessagingError, Result};
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{Attachment, InboundMessage, MessageContent, OutboundResponse, StatusUpdate};

use anyhow::Context as _;
use teloxide::Bot;
use teloxide::net::Download as _;
use teloxide::payloads::setters::*;
use teloxide::requests::{Request, Requester};
use teloxide::types::{ChatAction, ChatId, FileId, MediaKind, Message, MessageKind, UpdateKind};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

/// Telegram's per-message character limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_LONG_POLL_TIMEOUT_SECS: u32 = 30;
/// Must outlast the long poll, or idle `getUpdates` calls time out client-side.
const TELEGRAM_HTTP_TIMEOUT: Duration = Duration::from_secs(35);
const TELEGRAM_GET_UPDATES_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Typing indicators expire after 5 seconds on Telegram.
const TYPING_REFRESH_INTERVAL: Duration = Duration::from_secs(4);

const UNSUPPORTED_CONTENT_REPLY: &str =
    "Sorry, I couldn't process your message. Please send text, image, or audio.";

/// Telegram adapter state.
pub struct TelegramAdapter {
    bot: Bot,
    allowed_users: Arc<Vec<i64>>,
    greeting: Arc<String>,
    max_attachment_bytes: usize,
    /// Repeating typing indicator tasks per conversation_id.
    typing_tasks: Arc<RwLock<HashMap<String, JoinHandle<()>>>>,
    /// Shutdown signal for the polling loop.
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

/// A file referenced by a message, before download.
#[derive(Debug, Clone, PartialEq)]
struct PendingFile {
    file_id: String,
    size: u64,
    filename: String,
    mime_type: String,
}

impl TelegramAdapter {
    pub fn new(
        config: &TelegramConfig,
        greeting: impl Into<String>,
        max_attachment_bytes: usize,
    ) -> Self {
        Self {
            bot: build_telegram_bot(&config.token),
            allowed_users: Arc::new(config.allowed_users.clone()),
            greeting: Arc::new(greeting.into()),
            max_attachment_bytes,
            typing_tasks: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    async fn stop_typing(&self, conversation_id: &str) {
        if let Some(handle) = self.typing_tasks.write().await.remove(conversation_id) {
            handle.abort();
        }
    }
}

impl Messaging for TelegramAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let me = self
            .bot
            .get_me()
            .send()
            .await
            .context("failed to call getMe on Telegram")?;
        let bot_user_id = me.id;
        tracing::info!(
            bot_name = %me.first_name,
            bot_username = ?me.username,
            "telegram connected"
        );

        let bot = self.bot.clone();
        let allowed_users = self.allowed_users.clone();
        let greeting = self.greeting.clone();
        let max_attachment_bytes = self.max_attachment_bytes;

        tokio::spawn(async move {
            let mut offset = 0i32;
            // Last intake task per chat; the next message forwards only after it.
            let mut intake: HashMap<ChatId, JoinHandle<()>> = HashMap::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("telegram polling loop shutting down");
                        break;
                    }
                    result = bot
                        .get_updates()
                        .offset(offset)
                        .timeout(TELEGRAM_LONG_POLL_TIMEOUT_SECS)
                        .send() => {
                        let updates = match result {
                            Ok(updates) => updates,
                            Err(error) => {
                                tracing::error!(
                                    %error,
                                    retry_delay_secs = TELEGRAM_GET_UPDATES_RETRY_DELAY.as_secs(),
                                    "telegram getUpdates failed"
                                );
                                tokio::time::sleep(TELEGRAM_GET_UPDATES_RETRY_DELAY).await;
                                continue;
                            }
                        };

                        for update in updates {
                            offset = update.id.as_offset() as i32;

                            let UpdateKind::Message(message) = &update.kind else {
                                continue;
                            };

                            let Some(from) = &message.from else {
                                continue;
                            };
                            if from.id == bot_user_id {
                                continue;
                            }
                            if !is_allowed(&allowed_users, from.id.0 as i64) {
                                tracing::debug!(user_id = from.id.0, "telegram user not allowed");
                                continue;
                            }

                            let text = extract_text(message);

                            if text.as_deref().is_some_and(is_start_command) {
                                if let Err(error) = bot
                                    .send_message(message.chat.id, greeting.as_str())
                                    .send()
                                    .await
                                {
                                    tracing::warn!(%error, "failed to send telegram greeting");
                                }
                                continue;
                            }

                            let chat_id = message.chat.id;
                            let previous = intake.remove(&chat_id);
                            let handle = tokio::spawn(forward_message(
                                bot.clone(),
                                message.clone(),
                                text,
                                max_attachment_bytes,
                                inbound_tx.clone(),
                                previous,
                            ));
                            intake.insert(chat_id, handle);
                        }

                        intake.retain(|_, handle| !handle.is_finished());
                        if inbound_tx.is_closed() {
                            tracing::warn!("telegram inbound receiver dropped, stopping polling");
                            return;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    async fn respond(&self, message: &InboundMessage, response: OutboundResponse) -> Result<()> {
        let chat_id = extract_chat_id(message)?;

        match response {
            OutboundResponse::Text(text) => {
                self.stop_typing(&message.conversation_id).await;

                for part in split_oversized(&text, MAX_MESSAGE_LENGTH) {
                    self.bot
                        .send_message(chat_id, part)
                        .send()
                        .await
                        .context("failed to send telegram message")?;
                }
            }
        }

        Ok(())
    }

    async fn send_status(&self, message: &InboundMessage, status: StatusUpdate) -> Result<()> {
        match status {
            StatusUpdate::Thinking => {
                let chat_id = extract_chat_id(message)?;
                let bot = self.bot.clone();

                let handle = tokio::spawn(async move {
                    loop {
                        if let Err(error) = bot
                            .send_chat_action(chat_id, ChatAction::Typing)
                            .send()
                            .await
                        {
                            tracing::debug!(%error, "failed to send typing indicator");
                            break;
                        }
                        tokio::time::sleep(TYPING_REFRESH_INTERVAL).await;
                    }
                });

                if let Some(previous) = self
                    .typing_tasks
                    .write()
                    .await
                    .insert(message.conversation_id.clone(), handle)
                {
                    previous.abort();
                }
            }
            StatusUpdate::StopTyping => {
                self.stop_typing(&message.conversation_id).await;
            }
        }

        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.bot
            .get_me()
            .send()
            .await
            .context("telegram health check failed")?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        let mut tasks = self.typing_tasks.write().await;
        for (_, handle) in tasks.drain() {
            handle.abort();
        }

        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }

        tracing::info!("telegram adapter shut down");
        Ok(())
    }
}

// -- Helper functions --

/// Bot whose HTTP client keeps teloxide's defaults but waits out a full long poll.
fn build_telegram_bot(token: &str) -> Bot {
    match teloxide::net::default_reqwest_settings()
        .timeout(TELEGRAM_HTTP_TIMEOUT)
        .build()
    {
        Ok(client) => Bot::with_client(token, client),
        Err(error) => {
            tracing::warn!(
                %error,
                "failed to create telegram http client with custom timeout, falling back to default client"
            );
            Bot::new(token)
        }
    }
}

/// Download a message's media and forward it, keeping per-chat order.
async fn forward_message(
    bot: Bot,
    message: Message,
    text: Option<String>,
    max_attachment_bytes: usize,
    inbound_tx: mpsc::Sender<InboundMessage>,
    previous: Option<JoinHandle<()>>,
) {
    let files = pending_files(&message);
    let attachments = download_attachments(&bot, files, max_attachment_bytes).await;

    if text.is_none() && attachments.is_empty() {
        if let Err(error) = bot
            .send_message(message.chat.id, UNSUPPORTED_CONTENT_REPLY)
            .send()
            .await
        {
            tracing::warn!(%error, "failed to send telegram reply");
        }
        // Later messages in this chat chain on this task, so it must not
        // finish before the one it follows.
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        return;
    }

    let chat_id = message.chat.id.0;
    let sender_id = message
        .from
        .as_ref()
        .map(|from| from.id.0.to_string())
        .unwrap_or_default();
    let inbound = InboundMessage {
        id: message.id.0.to_string(),
        source: "telegram".into(),
        conversation_id: format!("telegram:{chat_id}"),
        sender_id,
        content: MessageContent::from_parts(text, attachments),
        timestamp: message.date,
        metadata: build_metadata(&message),
    };

    forward_after(previous, inbound_tx, inbound).await;
}

/// Send `inbound` once the chat's previous intake task has finished.
async fn forward_after(
    previous: Option<JoinHandle<()>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound: InboundMessage,
) {
    if let Some(previous) = previous {
        let _ = previous.await;
    }
    if let Err(error) = inbound_tx.send(inbound).await {
        tracing::warn!(
            %error,
            "failed to send inbound message from Telegram (receiver dropped)"
        );
    }
}

fn extract_chat_id(message: &InboundMessage) -> Result<ChatId> {
    let id = message
        .metadata
        .get("telegram_chat_id")
        .and_then(|value| value.as_i64())
        .ok_or_else(|| MessagingError::MissingMetadata {
            key: "telegram_chat_id".into(),
        })?;
    Ok(ChatId(id))
}

/// `/start`, optionally addressed to the bot (`/start@TaraBot`) or with a payload.
fn is_start_command(text: &str) -> bool {
    let Some(command) = text.split_whitespace().next() else {
        return false;
    };
    command == "/start" || command.starts_with("/start@")
}

/// An empty allow-list admits everyone.
fn is_allowed(allowed_users: &[i64], user_id: i64) -> bool {
    allowed_users.is_empty() || allowed_users.contains(&user_id)
}

/// Extract text content (or a media caption) from a Telegram message.
fn extract_text(message: &Message) -> Option<String> {
    let MessageKind::Common(common) = &message.kind else {
        return None;
    };
    let text = match &common.media_kind {
        MediaKind::Text(text) => Some(text.text.clone()),
        MediaKind::Photo(photo) => photo.caption.clone(),
        MediaKind::Document(doc) => doc.caption.clone(),
        MediaKind::Video(video) => video.caption.clone(),
        MediaKind::Voice(voice) => voice.caption.clone(),
        MediaKind::Audio(audio) => audio.caption.clone(),
        _ => None,
    };
    text.filter(|text| !text.trim().is_empty())
}

/// Files a message carries that the assistant can work with.
///
/// Photos use the largest size. Documents are only taken when they are images.
fn pending_files(message: &Message) -> Vec<PendingFile> {
    let MessageKind::Common(common) = &message.kind else {
        return Vec::new();
    };

    let file = match &common.media_kind {
        MediaKind::Photo(photo) => photo.photo.last().map(|largest| PendingFile {
            file_id: largest.file.id.to_string(),
            size: u64::from(largest.file.size),
            filename: format!("photo_{}.jpg", largest.file.unique_id),
            mime_type: "image/jpeg".into(),
        }),
        MediaKind::Voice(voice) => Some(PendingFile {
            file_id: voice.voice.file.id.to_string(),
            size: u64::from(voice.voice.file.size),
            filename: "voice.ogg".into(),
            mime_type: mime_or(voice.voice.mime_type.as_ref(), "audio/ogg"),
        }),
        MediaKind::Audio(audio) => Some(PendingFile {
            file_id: audio.audio.file.id.to_string(),
            size: u64::from(audio.audio.file.size),
            filename: audio
                .audio
                .file_name
                .clone()
                .unwrap_or_else(|| "audio".into()),
            mime_type: mime_or(audio.audio.mime_type.as_ref(), "audio/mpeg"),
        }),
        MediaKind::Video(video) => Some(PendingFile {
            file_id: video.video.file.id.to_string(),
            size: u64::from(video.video.file.size),
            filename: video
                .video
                .file_name
                .clone()
                .unwrap_or_else(|| "video.mp4".into()),
            mime_type: mime_or(video.video.mime_type.as_ref(), "video/mp4"),
        }),
        MediaKind::Document(doc) => {
            let mime_type = mime_or(doc.document.mime_type.as_ref(), "application/octet-stream");
            mime_type.starts_with("image/").then(|| PendingFile {
                file_id: doc.document.file.id.to_string(),
                size: u64::from(doc.document.file.size),
                filename: doc
                    .document
                    .file_name
                    .clone()
                    .unwrap_or_else(|| "image".into()),
                mime_type,
            })
        }
        _ => None,
    };

    file.into_iter().collect()
}

fn mime_or(mime: Option<&impl ToString>, fallback: &str) -> String {
    mime.map(|mime| mime.to_string())
        .unwrap_or_else(|| fallback.to_string())
}

/// Download files through the Bot API, skipping oversized or failed ones.
async fn download_attachments(
    bot: &Bot,
    files: Vec<PendingFile>,
    max_attachment_bytes: usize,
) -> Vec<Attachment> {
    let mut attachments = Vec::with_capacity(files.len());

    for file in files {
        if file.size > max_attachment_bytes as u64 {
            tracing::warn!(
                filename = %file.filename,
                size = file.size,
                max_attachment_bytes,
                "telegram attachment too large, skipping"
            );
            continue;
        }

        match download_file(bot, &file.file_id).await {
            Ok(data) => attachments.push(Attachment {
                filename: file.filename,
                mime_type: file.mime_type,
                data,
            }),
            Err(error) => {
                tracing::warn!(
                    file_id = %file.file_id,
                    %error,
                    "failed to download telegram file, skipping attachment"
                );
            }
        }
    }

    attachments
}

/// Resolve a file id with `getFile`, then download its contents.
async fn download_file(bot: &Bot, file_id: &str) -> Result<Vec<u8>> {
    let file = bot
        .get_file(FileId(file_id.to_string()))
        .send()
        .await
        .map_err(|error| MessagingError::MediaDownload(format!("getFile failed: {error}")))?;

    let mut data = Vec::new();
    bot.download_file(&file.path, &mut data)
        .await
        .map_err(|error| MessagingError::MediaDownload(error.to_string()))?;
    Ok(data)
}

/// Build platform-specific metadata for a Telegram message.
fn build_metadata(message: &Message) -> HashMap<String, serde_json::Value> {
    let mut metadata = HashMap::new();

    metadata.insert(
        "telegram_chat_id".into(),
        serde_json::Value::Number(message.chat.id.0.into()),
    );
    metadata.insert(
        "telegram_message_id".into(),
        serde_json::Value::Number(message.id.0.into()),
    );

    if let Some(from) = &message.from {
        let display_name = match &from.last_name {
            Some(last) => format!("{} {last}", from.first_name),
            None => from.first_name.clone(),
        };
        metadata.insert("display_name".into(), display_name.into());

        if let Some(username) = &from.username {
            metadata.insert("telegram_username".into(), username.clone().into());
        }
    }

    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_start_command_variants() {
        assert!(is_start_command("/start"));
        assert!(is_start_command("/start@TaraBot"));
        assert!(is_start_command("/start referral-42"));
        assert!(!is_start_command("/started"));
        assert!(!is_start_command("please /start"));
        assert!(!is_start_command(""));
    }

    #[test]
    fn empty_allow_list_admits_everyone() {
        assert!(is_allowed(&[], 7));
        assert!(is_allowed(&[7, 8], 8));
        assert!(!is_allowed(&[7, 8], 9));
    }

    #[test]
    fn telegram_http_timeout_is_greater_than_long_poll_timeout() {
        assert!(
            TELEGRAM_HTTP_TIMEOUT > Duration::from_secs(TELEGRAM_LONG_POLL_TIMEOUT_SECS as u64)
        );
    }

    /// An idle long poll answered after teloxide's default 17 s client timeout
    /// still succeeds.
    #[tokio::test]
    async fn idle_long_poll_outlives_the_http_client() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        async fn slow_get_updates() -> axum::Json<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(18)).await;
            axum::Json(serde_json::json!({ "ok": true, "result": [] }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let api_url = reqwest::Url::parse(&format!("http://{}", listener.local_addr().unwrap()))
            .unwrap();
        let app = axum::Router::new().fallback(slow_get_updates);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let adapter = TelegramAdapter::new(
            &TelegramConfig {
                token: "123:abc".into(),
                allowed_users: Vec::new(),
            },
            "Hi!",
            1024,
        );
        let bot = adapter.bot.clone().set_api_url(api_url);

        let updates = bot
            .get_updates()
            .timeout(TELEGRAM_LONG_POLL_TIMEOUT_SECS)
            .send()
            .await;

        assert!(matches!(updates, Ok(ref updates) if updates.is_empty()), "{updates:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_download_does_not_reorder_a_chat() {
        let (inbound_tx, mut inbound_rx) = mpsc::channel(4);

        let photo_tx = inbound_tx.clone();
        let photo = tokio::spawn(async move {
            // Stands in for a long media download.
            tokio::time::sleep(Duration::from_secs(10)).await;
            forward_after(None, photo_tx, InboundMessage::text("telegram", "7", "photo")).await;
        });
        let text = tokio::spawn(forward_after(
            Some(photo),
            inbound_tx,
            InboundMessage::text("telegram", "7", "is this a good deal?"),
        ));

        text.await.unwrap();
        let order: Vec<String> = [inbound_rx.recv().await, inbound_rx.recv().await]
            .into_iter()
            .flatten()
            .map(|message| message.content.prompt_text())
            .collect();
        assert_eq!(order, vec!["photo", "is this a good deal?"]);
    }

    #[test]
    fn typing_refresh_beats_indicator_expiry() {
        assert!(TYPING_REFRESH_INTERVAL < Duration::from_secs(5));
    }

    #[test]
    fn chat_id_comes_from_metadata() {
        let mut message = InboundMessage::text("telegram", "7", "hi");
        assert!(matches!(
            extract_chat_id(&message),
            Err(crate::Error::Messaging(MessagingError::MissingMetadata { .. }))
        ));

        message
            .metadata
            .insert("telegram_chat_id".into(), serde_json::json!(-1001));
        assert_eq!(extract_chat_id(&message).unwrap(), ChatId(-1001));
    }
}
