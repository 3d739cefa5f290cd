//! WhatsApp Business Cloud API adapter.
//!
//! Inbound messages arrive on an axum webhook server; replies, read receipts
//! and media downloads go through the Graph API.

use crate::chunk::split_oversized;
use crate::config::WhatsAppConfig;
use crate::error::{MessagingError, Result};
use crate::messaging::traits::{InboundStream, Messaging};
use crate::{Attachment, InboundMessage, MessageContent, OutboundResponse, StatusUpdate};

use anyhow::Context as _;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

type HmacSha256 = Hmac<Sha256>;

/// WhatsApp's text message body limit.
const MAX_MESSAGE_LENGTH: usize = 4096;

const MEDIA_FAILURE_REPLY: &str = "Sorry, I couldn't process the media. Please try again.";

/// WhatsApp adapter state.
pub struct WhatsAppAdapter {
    bind: String,
    port: u16,
    verify_token: Arc<String>,
    app_secret: Option<Arc<String>>,
    graph: GraphApi,
    max_attachment_bytes: usize,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    local_addr: Arc<RwLock<Option<SocketAddr>>>,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

/// Shared state for axum handlers.
#[derive(Clone)]
struct AppState {
    verify_token: Arc<String>,
    app_secret: Option<Arc<String>>,
    graph: GraphApi,
    max_attachment_bytes: usize,
    inbound_tx: Arc<RwLock<Option<mpsc::Sender<InboundMessage>>>>,
}

impl WhatsAppAdapter {
    pub fn new(config: &WhatsAppConfig, max_attachment_bytes: usize) -> Result<Self> {
        Ok(Self {
            bind: config.bind.clone(),
            port: config.port,
            verify_token: Arc::new(config.verify_token.clone()),
            app_secret: config.app_secret.clone().map(Arc::new),
            graph: GraphApi::new(config)?,
            max_attachment_bytes,
            inbound_tx: Arc::new(RwLock::new(None)),
            local_addr: Arc::new(RwLock::new(None)),
            shutdown_tx: Arc::new(RwLock::new(None)),
        })
    }

    /// Address the webhook server is listening on, once started.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read().await
    }

    fn extract_recipient<'a>(&self, message: &'a InboundMessage) -> Result<&'a str> {
        message
            .metadata
            .get("whatsapp_from")
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                MessagingError::MissingMetadata {
                    key: "whatsapp_from".into(),
                }
                .into()
            })
    }
}

impl Messaging for WhatsAppAdapter {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.inbound_tx.write().await = Some(inbound_tx);
        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let state = AppState {
            verify_token: self.verify_token.clone(),
            app_secret: self.app_secret.clone(),
            graph: self.graph.clone(),
            max_attachment_bytes: self.max_attachment_bytes,
            inbound_tx: self.inbound_tx.clone(),
        };

        let app = Router::new()
            .route("/webhook", get(handle_verify).post(handle_webhook))
            .route("/health", get(handle_health))
            .with_state(state);

        let bind = if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        };
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .with_context(|| format!("failed to bind whatsapp webhook server to {bind}"))?;
        let local_addr = listener
            .local_addr()
            .context("failed to read whatsapp webhook address")?;
        *self.local_addr.write().await = Some(local_addr);
        tracing::info!(%local_addr, "whatsapp webhook server listening");

        tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
            {
                tracing::error!(%error, "whatsapp webhook server exited with error");
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    fn max_message_length(&self) -> usize {
        MAX_MESSAGE_LENGTH
    }

    async fn respond(&self, message: &InboundMessage, response: OutboundResponse) -> Result<()> {
        match response {
            OutboundResponse::Text(text) => {
                let to = self.extract_recipient(message)?;
                for part in split_oversized(&text, MAX_MESSAGE_LENGTH) {
                    self.graph.send_text(to, &part).await?;
                }
                Ok(())
            }
        }
    }

    async fn send_status(&self, message: &InboundMessage, status: StatusUpdate) -> Result<()> {
        match status {
            StatusUpdate::Thinking => {
                let Some(message_id) = message
                    .metadata
                    .get("whatsapp_message_id")
                    .and_then(|value| value.as_str())
                else {
                    return Ok(());
                };
                self.graph.mark_read_with_typing(message_id).await
            }
            // The indicator clears itself when the reply lands.
            StatusUpdate::StopTyping => Ok(()),
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.graph.phone_number_status().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.inbound_tx.write().await.take();
        if let Some(tx) = self.shutdown_tx.read().await.as_ref() {
            tx.send(()).await.ok();
        }
        tracing::info!("whatsapp adapter shut down");
        Ok(())
    }
}

// -- Webhook handlers --

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

async fn handle_verify(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> std::result::Result<String, StatusCode> {
    verify_subscription(
        query.mode.as_deref(),
        query.verify_token.as_deref(),
        query.challenge.as_deref(),
        &state.verify_token,
    )
    .ok_or_else(|| {
        tracing::warn!(mode = ?query.mode, "whatsapp webhook verification failed");
        StatusCode::FORBIDDEN
    })
}

async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    if let Some(app_secret) = &state.app_secret {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|value| value.to_str().ok());
        let valid = signature.is_some_and(|signature| verify_signature(&body, signature, app_secret));
        if !valid {
            tracing::warn!("rejected whatsapp webhook with missing or invalid signature");
            return StatusCode::UNAUTHORIZED;
        }
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(error) => {
            tracing::warn!(%error, "malformed whatsapp webhook payload");
            return StatusCode::BAD_REQUEST;
        }
    };

    tokio::spawn(process_payload(state, payload));
    StatusCode::OK
}

async fn handle_health() -> &'static str {
    "ok"
}

/// Check a `hub.*` subscription request. Returns the challenge to echo on success.
fn verify_subscription(
    mode: Option<&str>,
    token: Option<&str>,
    challenge: Option<&str>,
    verify_token: &str,
) -> Option<String> {
    let mode = mode?;
    let token = token?;
    let challenge = challenge?;

    if mode == "subscribe" && !verify_token.is_empty() && token == verify_token {
        Some(challenge.to_string())
    } else {
        None
    }
}

/// Verify an `X-Hub-Signature-256` header (`sha256=<hex>`) against the raw body.
fn verify_signature(body: &[u8], signature_header: &str, app_secret: &str) -> bool {
    let Some(expected) = signature_header.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(app_secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let computed = hex::encode(mac.finalize().into_bytes());

    constant_time_eq(&computed, &expected.to_ascii_lowercase())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// -- Payload types --

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<WebhookEntry>,
}

#[derive(Debug, Deserialize)]
struct WebhookEntry {
    #[serde(default)]
    changes: Vec<WebhookChange>,
}

#[derive(Debug, Deserialize)]
struct WebhookChange {
    field: String,
    value: ChangeValue,
}

#[derive(Debug, Deserialize)]
struct ChangeValue {
    metadata: Option<ValueMetadata>,
    #[serde(default)]
    contacts: Vec<Contact>,
    #[serde(default)]
    messages: Vec<WebhookMessage>,
}

#[derive(Debug, Deserialize)]
struct ValueMetadata {
    phone_number_id: String,
}

#[derive(Debug, Deserialize)]
struct Contact {
    wa_id: String,
    profile: Option<ContactProfile>,
}

#[derive(Debug, Deserialize)]
struct ContactProfile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WebhookMessage {
    from: String,
    id: String,
    timestamp: Option<String>,
    #[serde(rename = "type")]
    message_type: String,
    text: Option<TextBody>,
    image: Option<MediaRef>,
    audio: Option<MediaRef>,
    video: Option<MediaRef>,
    document: Option<MediaRef>,
}

#[derive(Debug, Deserialize)]
struct TextBody {
    body: String,
}

#[derive(Debug, Deserialize)]
struct MediaRef {
    id: String,
    mime_type: Option<String>,
    caption: Option<String>,
    filename: Option<String>,
}

impl WebhookMessage {
    fn text_body(&self) -> Option<String> {
        let text = match self.message_type.as_str() {
            "text" => self.text.as_ref().map(|text| text.body.clone()),
            _ => self.media().and_then(|(_, media)| media.caption.clone()),
        };
        text.filter(|text| !text.trim().is_empty())
    }

    /// The media reference matching the message type, with its fallback mime type.
    fn media(&self) -> Option<(&'static str, &MediaRef)> {
        match self.message_type.as_str() {
            "image" => self.image.as_ref().map(|media| ("image/jpeg", media)),
            "audio" => self.audio.as_ref().map(|media| ("audio/ogg", media)),
            "video" => self.video.as_ref().map(|media| ("video/mp4", media)),
            "document" => self
                .document
                .as_ref()
                .map(|media| ("application/octet-stream", media)),
            _ => None,
        }
    }
}

async fn process_payload(state: AppState, payload: WebhookPayload) {
    for entry in payload.entry {
        for change in entry.changes {
            if change.field != "messages" {
                tracing::debug!(field = %change.field, "ignoring non-message whatsapp webhook");
                continue;
            }

            let value = change.value;

            if let Some(metadata) = &value.metadata
                && metadata.phone_number_id != state.graph.phone_number_id
            {
                tracing::warn!(
                    expected = %state.graph.phone_number_id,
                    received = %metadata.phone_number_id,
                    "whatsapp phone number id mismatch"
                );
                continue;
            }

            let contacts: HashMap<String, String> = value
                .contacts
                .iter()
                .filter_map(|contact| {
                    contact
                        .profile
                        .as_ref()
                        .map(|profile| (contact.wa_id.clone(), profile.name.clone()))
                })
                .collect();

            for message in value.messages {
                let Some(inbound) = build_inbound(&state, &message, &contacts).await else {
                    continue;
                };

                let sender = state.inbound_tx.read().await.clone();
                let Some(sender) = sender else {
                    tracing::debug!("whatsapp adapter stopped, dropping message");
                    return;
                };
                if sender.send(inbound).await.is_err() {
                    tracing::warn!("failed to forward whatsapp message (receiver dropped)");
                    return;
                }
            }
        }
    }
}

async fn build_inbound(
    state: &AppState,
    message: &WebhookMessage,
    contacts: &HashMap<String, String>,
) -> Option<InboundMessage> {
    let text = message.text_body();

    let mut attachments = Vec::new();
    if let Some((fallback_mime, media)) = message.media() {
        match state
            .graph
            .download_media(&media.id, state.max_attachment_bytes)
            .await
        {
            Ok(download) => attachments.push(Attachment {
                filename: media
                    .filename
                    .clone()
                    .unwrap_or_else(|| format!("{}_{}", message.message_type, media.id)),
                mime_type: media
                    .mime_type
                    .clone()
                    .or(download.mime_type)
                    .unwrap_or_else(|| fallback_mime.to_string()),
                data: download.data,
            }),
            Err(error) => {
                tracing::warn!(media_id = %media.id, %error, "failed to download whatsapp media");
                if let Err(error) = state.graph.send_text(&message.from, MEDIA_FAILURE_REPLY).await
                {
                    tracing::warn!(%error, "failed to send whatsapp media failure reply");
                }
                return None;
            }
        }
    }

    if text.is_none() && attachments.is_empty() {
        tracing::debug!(message_type = %message.message_type, "ignoring unsupported whatsapp message");
        return None;
    }

    let timestamp = message
        .timestamp
        .as_deref()
        .and_then(|seconds| seconds.parse::<i64>().ok())
        .and_then(|seconds| chrono::DateTime::from_timestamp(seconds, 0))
        .unwrap_or_else(chrono::Utc::now);

    let mut metadata = HashMap::new();
    metadata.insert("whatsapp_from".into(), message.from.clone().into());
    metadata.insert("whatsapp_message_id".into(), message.id.clone().into());
    if let Some(name) = contacts.get(&message.from) {
        metadata.insert("display_name".into(), name.clone().into());
    }

    Some(InboundMessage {
        id: message.id.clone(),
        source: "whatsapp".into(),
        conversation_id: format!("whatsapp:{}", message.from),
        sender_id: message.from.clone(),
        content: MessageContent::from_parts(text, attachments),
        timestamp,
        metadata,
    })
}

// -- Graph API client --

struct MediaDownload {
    data: Vec<u8>,
    mime_type: Option<String>,
}

#[derive(Clone)]
struct GraphApi {
    http_client: reqwest::Client,
    base_url: String,
    api_version: String,
    access_token: String,
    phone_number_id: String,
}

impl GraphApi {
    fn new(config: &WhatsAppConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            access_token: config.access_token.clone(),
            phone_number_id: config.phone_number_id.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{path}", self.base_url, self.api_version)
    }

    async fn post_message(&self, body: serde_json::Value) -> Result<()> {
        let url = self.endpoint(&format!("{}/messages", self.phone_number_id));
        let response = self
            .http_client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .context("whatsapp messages request failed")?;

        check_status(response).await?;
        Ok(())
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "text",
            "text": { "preview_url": false, "body": text },
        }))
        .await
    }

    async fn mark_read_with_typing(&self, message_id: &str) -> Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
            "typing_indicator": { "type": "text" },
        }))
        .await
    }

    async fn download_media(&self, media_id: &str, max_bytes: usize) -> Result<MediaDownload> {
        let response = self
            .http_client
            .get(self.endpoint(media_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|error| MessagingError::MediaDownload(error.to_string()))?;
        let info = check_status(response).await?;

        let Some(url) = info["url"].as_str() else {
            return Err(MessagingError::MediaDownload(format!("no url for media {media_id}")).into());
        };
        if let Some(size) = info["file_size"].as_u64()
            && size > max_bytes as u64
        {
            return Err(MessagingError::MediaDownload(format!(
                "media {media_id} is {size} bytes, limit is {max_bytes}"
            ))
            .into());
        }

        let mut response = self
            .http_client
            .get(url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|error| MessagingError::MediaDownload(error.to_string()))?;
        if !response.status().is_success() {
            return Err(MessagingError::MediaDownload(format!(
                "media download returned {}",
                response.status()
            ))
            .into());
        }
        let too_large = || {
            MessagingError::MediaDownload(format!("media {media_id} exceeds {max_bytes} bytes"))
        };
        if response
            .content_length()
            .is_some_and(|length| length > max_bytes as u64)
        {
            return Err(too_large().into());
        }

        // Stop reading as soon as the limit is crossed.
        let mut data = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|error| MessagingError::MediaDownload(error.to_string()))?
        {
            if data.len() + chunk.len() > max_bytes {
                return Err(too_large().into());
            }
            data.extend_from_slice(&chunk);
        }

        Ok(MediaDownload {
            data,
            mime_type: info["mime_type"].as_str().map(str::to_string),
        })
    }

    async fn phone_number_status(&self) -> Result<()> {
        let response = self
            .http_client
            .get(self.endpoint(&self.phone_number_id))
            .bearer_auth(&self.access_token)
            .send()
            .await
            .context("whatsapp health check failed")?;
        check_status(response).await?;
        Ok(())
    }
}

/// Parse a Graph API response, turning error statuses into errors.
async fn check_status(response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    if status.is_success() {
        Ok(body)
    } else {
        let message = body["error"]["message"].as_str().unwrap_or("unknown error");
        Err(anyhow::anyhow!("whatsapp API returned {status}: {message}").into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::extract::Path;
    use axum::routing::post;
    use futures::StreamExt as _;
    use std::time::Duration;

    #[test]
    fn signature_round_trip() {
        let body = br#"{"entry":[]}"#;
        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body);
        let header = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        assert!(verify_signature(body, &header, "app-secret"));
        assert!(verify_signature(body, &header.to_uppercase().replace("SHA256=", "sha256="), "app-secret"));
        assert!(!verify_signature(body, &header, "other-secret"));
        assert!(!verify_signature(b"tampered", &header, "app-secret"));
        assert!(!verify_signature(body, header.trim_start_matches("sha256="), "app-secret"));
    }

    #[test]
    fn subscription_requires_matching_token() {
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("tok"), Some("123"), "tok"),
            Some("123".into())
        );
        assert_eq!(
            verify_subscription(Some("subscribe"), Some("bad"), Some("123"), "tok"),
            None
        );
        assert_eq!(
            verify_subscription(Some("unsubscribe"), Some("tok"), Some("123"), "tok"),
            None
        );
        assert_eq!(verify_subscription(Some("subscribe"), Some(""), Some("1"), ""), None);
        assert_eq!(verify_subscription(None, Some("tok"), Some("1"), "tok"), None);
    }

    #[test]
    fn parses_text_and_media_messages() {
        let payload: WebhookPayload = serde_json::from_str(indoc::indoc! {r#"
            {
              "object": "whatsapp_business_account",
              "entry": [{
                "id": "1",
                "changes": [{
                  "field": "messages",
                  "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "display_phone_number": "15550000000", "phone_number_id": "PN" },
                    "contacts": [{ "profile": { "name": "Asha" }, "wa_id": "919800000000" }],
                    "messages": [
                      { "from": "919800000000", "id": "wamid.1", "timestamp": "1700000000",
                        "type": "text", "text": { "body": "hello" } },
                      { "from": "919800000000", "id": "wamid.2", "timestamp": "1700000001",
                        "type": "image", "image": { "id": "MEDIA1", "mime_type": "image/png" } },
                      { "from": "919800000000", "id": "wamid.3", "type": "sticker",
                        "sticker": { "id": "S1" } }
                    ]
                  }
                }]
              }]
            }
        "#})
        .unwrap();

        let messages = &payload.entry[0].changes[0].value.messages;
        assert_eq!(messages[0].text_body().as_deref(), Some("hello"));
        assert!(messages[0].media().is_none());

        let (_, media) = messages[1].media().unwrap();
        assert_eq!(media.id, "MEDIA1");
        assert_eq!(messages[1].text_body(), None);

        assert!(messages[2].media().is_none());
        assert_eq!(messages[2].text_body(), None);
    }

    /// Minimal stand-in for the Graph API.
    #[derive(Clone, Default)]
    struct FakeGraph {
        base_url: Arc<std::sync::Mutex<String>>,
        sent: Arc<std::sync::Mutex<Vec<serde_json::Value>>>,
    }

    async fn spawn_fake_graph() -> FakeGraph {
        async fn media_info(
            State(graph): State<FakeGraph>,
            Path(media_id): Path<String>,
        ) -> Json<serde_json::Value> {
            let base_url = graph.base_url.lock().unwrap().clone();
            let mut info = serde_json::json!({
                "url": format!("{base_url}/files/{media_id}"),
                "mime_type": "image/jpeg",
            });
            if media_id != "SIZELESS" {
                info["file_size"] = serde_json::json!(8);
            }
            Json(info)
        }

        async fn media_file(
            Path(media_id): Path<String>,
            headers: HeaderMap,
        ) -> std::result::Result<axum::body::Body, StatusCode> {
            if headers.get("authorization").and_then(|v| v.to_str().ok())
                != Some("Bearer graph-token")
            {
                return Err(StatusCode::UNAUTHORIZED);
            }
            if media_id == "SIZELESS" {
                // Chunked, so no content-length reaches the client.
                let parts = vec![
                    Ok::<_, std::io::Error>(Bytes::from_static(b"jpeg")),
                    Ok(Bytes::from_static(b"data")),
                ];
                return Ok(axum::body::Body::from_stream(futures::stream::iter(parts)));
            }
            Ok(axum::body::Body::from(&b"jpegdata"[..]))
        }

        async fn messages(
            State(graph): State<FakeGraph>,
            Json(body): Json<serde_json::Value>,
        ) -> Json<serde_json::Value> {
            graph.sent.lock().unwrap().push(body);
            Json(serde_json::json!({ "messages": [{ "id": "wamid.out" }] }))
        }

        let graph = FakeGraph::default();
        let app = Router::new()
            .route("/v18.0/{media_id}", get(media_info))
            .route("/v18.0/{phone_number_id}/messages", post(messages))
            .route("/files/{media_id}", get(media_file))
            .with_state(graph.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        *graph.base_url.lock().unwrap() = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        graph
    }

    fn config(graph_base_url: &str, app_secret: Option<&str>) -> WhatsAppConfig {
        WhatsAppConfig {
            access_token: "graph-token".into(),
            phone_number_id: "PN".into(),
            verify_token: "verify-me".into(),
            app_secret: app_secret.map(str::to_string),
            api_version: "v18.0".into(),
            graph_base_url: graph_base_url.into(),
            bind: "127.0.0.1".into(),
            port: 0,
        }
    }

    fn image_payload() -> String {
        serde_json::json!({
            "object": "whatsapp_business_account",
            "entry": [{ "changes": [{
                "field": "messages",
                "value": {
                    "metadata": { "phone_number_id": "PN" },
                    "contacts": [{ "profile": { "name": "Asha" }, "wa_id": "9198" }],
                    "messages": [{
                        "from": "9198", "id": "wamid.in", "timestamp": "1700000000",
                        "type": "image", "image": { "id": "MEDIA1", "caption": "my payslip" }
                    }]
                }
            }]}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn webhook_delivers_media_messages_and_replies_go_to_graph() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let graph = spawn_fake_graph().await;
        let base_url = graph.base_url.lock().unwrap().clone();
        let adapter = WhatsAppAdapter::new(&config(&base_url, None), 1024).unwrap();
        let mut stream = adapter.start().await.unwrap();
        let addr = adapter.local_addr().await.unwrap();
        let client = reqwest::Client::new();

        let verify = client
            .get(format!("http://{addr}/webhook"))
            .query(&[
                ("hub.mode", "subscribe"),
                ("hub.verify_token", "verify-me"),
                ("hub.challenge", "42"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(verify.status(), reqwest::StatusCode::OK);
        assert_eq!(verify.text().await.unwrap(), "42");

        let posted = client
            .post(format!("http://{addr}/webhook"))
            .header("content-type", "application/json")
            .body(image_payload())
            .send()
            .await
            .unwrap();
        assert_eq!(posted.status(), reqwest::StatusCode::OK);

        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.user_key(), "whatsapp:9198");
        assert_eq!(message.metadata["display_name"], "Asha");
        assert_eq!(message.content.prompt_text(), "my payslip");
        let attachment = &message.content.attachments()[0];
        assert_eq!(attachment.mime_type, "image/jpeg");
        assert_eq!(attachment.data, b"jpegdata");

        adapter
            .respond(&message, OutboundResponse::Text("Let's look at it.".into()))
            .await
            .unwrap();
        adapter.send_status(&message, StatusUpdate::Thinking).await.unwrap();

        let sent = graph.sent.lock().unwrap().clone();
        assert_eq!(sent[0]["to"], "9198");
        assert_eq!(sent[0]["text"]["body"], "Let's look at it.");
        assert_eq!(sent[1]["status"], "read");
        assert_eq!(sent[1]["message_id"], "wamid.in");

        adapter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn media_without_declared_size_is_capped_while_reading() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let graph = spawn_fake_graph().await;
        let base_url = graph.base_url.lock().unwrap().clone();
        let api = GraphApi::new(&config(&base_url, None)).unwrap();

        let result = api.download_media("SIZELESS", 6).await;
        assert!(matches!(
            result,
            Err(crate::Error::Messaging(MessagingError::MediaDownload(reason)))
                if reason.contains("exceeds 6 bytes")
        ));

        let media = api.download_media("SIZELESS", 1024).await.unwrap();
        assert_eq!(media.data, b"jpegdata");
        assert_eq!(media.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn unsigned_or_malformed_posts_are_rejected() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let adapter =
            WhatsAppAdapter::new(&config("http://127.0.0.1:9", Some("app-secret")), 1024).unwrap();
        let _stream = adapter.start().await.unwrap();
        let addr = adapter.local_addr().await.unwrap();
        let client = reqwest::Client::new();

        let unsigned = client
            .post(format!("http://{addr}/webhook"))
            .body(image_payload())
            .send()
            .await
            .unwrap();
        assert_eq!(unsigned.status(), reqwest::StatusCode::UNAUTHORIZED);

        let body = "not json";
        let mut mac = HmacSha256::new_from_slice(b"app-secret").unwrap();
        mac.update(body.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let malformed = client
            .post(format!("http://{addr}/webhook"))
            .header("x-hub-signature-256", signature)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

        let wrong_token = client
            .get(format!("http://{addr}/webhook"))
            .query(&[
                ("hub.mode", "subscribe"),
                ("hub.verify_token", "nope"),
                ("hub.challenge", "42"),
            ])
            .send()
            .await
            .unwrap();
        assert_eq!(wrong_token.status(), reqwest::StatusCode::FORBIDDEN);

        let health = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.text().await.unwrap(), "ok");

        adapter.shutdown().await.unwrap();
    }
}
