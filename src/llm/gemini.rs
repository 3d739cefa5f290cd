//! Gemini `generateContent` client.

use crate::config::LlmConfig;
use crate::conversation::Exchange;
use crate::error::{LlmError, Result};
use crate::Attachment;

use anyhow::Context as _;
use base64::Engine as _;

/// A single completion: system prompt, prior exchanges and the new user turn.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system_instruction: String,
    pub history: Vec<Exchange>,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
}

/// Thin client over the Gemini REST API.
#[derive(Debug, Clone)]
pub struct GeminiClient {
    http_client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: Option<f32>,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| LlmError::MissingProviderKey("gemini".into()))?;

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http_client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
            temperature: config.temperature,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run one completion and return the reply text.
    pub async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        let body = build_request_body(request, self.temperature);

        let response = self
            .http_client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|error| LlmError::ProviderRequest(error.to_string()))?;

        let status = response.status();
        let response_text = response.text().await.map_err(|error| {
            LlmError::ProviderRequest(format!("failed to read response body: {error}"))
        })?;

        let response_body: serde_json::Value =
            serde_json::from_str(&response_text).map_err(|error| {
                LlmError::ProviderRequest(format!(
                    "Gemini response ({status}) is not valid JSON: {error}\nBody: {}",
                    truncate_body(&response_text)
                ))
            })?;

        if !status.is_success() {
            let message = response_body["error"]["message"]
                .as_str()
                .unwrap_or("unknown error");
            return Err(LlmError::ProviderStatus {
                status: status.as_u16(),
                message: message.to_string(),
            }
            .into());
        }

        extract_text(&response_body)
    }
}

/// Build the JSON body for `generateContent`.
pub fn build_request_body(
    request: &CompletionRequest,
    temperature: Option<f32>,
) -> serde_json::Value {
    let mut contents = Vec::with_capacity(request.history.len() * 2 + 1);

    for exchange in &request.history {
        contents.push(serde_json::json!({
            "role": "user",
            "parts": [{ "text": exchange.user }],
        }));
        contents.push(serde_json::json!({
            "role": "model",
            "parts": [{ "text": exchange.assistant }],
        }));
    }

    let mut parts = Vec::with_capacity(request.attachments.len() + 1);
    for attachment in &request.attachments {
        parts.push(serde_json::json!({
            "inline_data": {
                "mime_type": attachment.mime_type,
                "data": base64::engine::general_purpose::STANDARD.encode(&attachment.data),
            }
        }));
    }
    parts.push(serde_json::json!({ "text": request.prompt }));

    contents.push(serde_json::json!({
        "role": "user",
        "parts": parts,
    }));

    let mut body = serde_json::json!({ "contents": contents });

    if !request.system_instruction.is_empty() {
        body["system_instruction"] = serde_json::json!({
            "parts": [{ "text": request.system_instruction }],
        });
    }

    if let Some(temperature) = temperature {
        body["generationConfig"] = serde_json::json!({ "temperature": temperature });
    }

    body
}

/// Pull the reply text out of a `generateContent` response.
pub fn extract_text(response_body: &serde_json::Value) -> Result<String> {
    if let Some(reason) = response_body["promptFeedback"]["blockReason"].as_str() {
        return Err(LlmError::CompletionFailed(format!("prompt blocked: {reason}")).into());
    }

    let Some(candidate) = response_body["candidates"]
        .as_array()
        .and_then(|candidates| candidates.first())
    else {
        return Err(LlmError::CompletionFailed("response has no candidates".into()).into());
    };

    let text = candidate["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        if let Some(reason) = candidate["finishReason"].as_str()
            && reason != "STOP"
        {
            return Err(
                LlmError::CompletionFailed(format!("generation stopped: {reason}")).into(),
            );
        }
        return Err(LlmError::EmptyReply.into());
    }

    Ok(text)
}

fn truncate_body(body: &str) -> &str {
    match body.char_indices().nth(500) {
        Some((byte_index, _)) => &body[..byte_index],
        None => body,
    }
}
