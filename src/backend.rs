//! Backend adapters: the uniform completion capability every provider exposes
//!
//! The router only ever sees [`ChatBackend::complete`]. Each backend family needs a slightly
//! different request shape, so the wire format is chosen once, when the registry is built, from
//! the closed set in [`AdapterKind`].
use crate::client::HttpClient;
use crate::errors::ProviderCallError;
use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};
use url::Url;

const MAX_RESPONSE_BYTES: usize = 8 * 1024 * 1024;
const MAX_ERROR_SNIPPET: usize = 200;

/// One completion call, as the router hands it to a backend.
#[derive(Debug, Clone, Copy)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system_prompt: &'a str,
    pub user_prompt: &'a str,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// What a backend produced. `content` may be empty; the router decides what that means.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tokens_in: Option<u64>,
    pub tokens_out: Option<u64>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait ChatBackend: Send + Sync + std::fmt::Debug {
    async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Completion, ProviderCallError>;
}

/// The request shapes the router knows how to speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// `POST {base}/chat/completions` with bearer auth (OpenAI, OpenRouter, Groq, DeepSeek, Ollama...)
    OpenaiChat,
    /// `POST {base}/models/{model}:generateContent` (Google Gemini)
    Gemini,
}

impl AdapterKind {
    /// The adapter a family uses when the config doesn't say.
    pub fn for_family(family: &str) -> Self {
        match family {
            "google" | "gemini" => AdapterKind::Gemini,
            _ => AdapterKind::OpenaiChat,
        }
    }

    pub fn build<T>(
        self,
        client: T,
        base_url: Url,
        key: Option<String>,
        timeout: Duration,
    ) -> Arc<dyn ChatBackend>
    where
        T: HttpClient + 'static,
    {
        match self {
            AdapterKind::OpenaiChat => Arc::new(OpenAiChat {
                client,
                base_url,
                key,
                timeout,
            }),
            AdapterKind::Gemini => Arc::new(Gemini {
                client,
                base_url,
                key,
                timeout,
            }),
        }
    }
}

/// OpenAI-compatible chat completions.
#[derive(Debug)]
pub struct OpenAiChat<T> {
    client: T,
    base_url: Url,
    key: Option<String>,
    timeout: Duration,
}

/// Lenient view of a chat completion. Providers add all sorts of extra fields; only the parts
/// the router reads are declared.
#[derive(Debug, Deserialize)]
struct LenientChatCompletion {
    #[serde(default)]
    choices: Vec<LenientChoice>,
    #[serde(default)]
    usage: Option<LenientUsage>,
}

#[derive(Debug, Deserialize)]
struct LenientChoice {
    #[serde(default)]
    message: Option<LenientMessage>,
}

#[derive(Debug, Deserialize)]
struct LenientMessage {
    #[serde(default)]
    content: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct LenientUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    /// Catch-all for provider-specific usage fields
    #[serde(flatten)]
    _extra: HashMap<String, serde_json::Value>,
}

#[async_trait]
impl<T: HttpClient> ChatBackend for OpenAiChat<T> {
    #[instrument(skip(self, request), fields(model = request.model))]
    async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Completion, ProviderCallError> {
        let body = json!({
            "model": request.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": request.user_prompt},
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        });
        let uri = endpoint(&self.base_url, "chat/completions");
        let auth = self.key.as_ref().map(|key| ("authorization", format!("Bearer {key}")));

        let bytes = send_json(&self.client, &uri, auth, &body, self.timeout).await?;
        let completion: LenientChatCompletion = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderCallError::new(format!("Malformed completion response: {e}")))?;

        let content = completion
            .choices
            .first()
            .and_then(|choice| choice.message.as_ref())
            .and_then(|message| message.content.as_ref())
            .map(content_to_string)
            .unwrap_or_default();

        Ok(Completion {
            content,
            tokens_in: completion.usage.as_ref().map(|u| u.prompt_tokens),
            tokens_out: completion.usage.as_ref().map(|u| u.completion_tokens),
        })
    }
}

/// Google Gemini `generateContent`.
#[derive(Debug)]
pub struct Gemini<T> {
    client: T,
    base_url: Url,
    key: Option<String>,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

#[async_trait]
impl<T: HttpClient> ChatBackend for Gemini<T> {
    #[instrument(skip(self, request), fields(model = request.model))]
    async fn complete(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Completion, ProviderCallError> {
        // Gemini has no system role on this endpoint, so both prompts go in one user turn.
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": format!("{}\n\n{}", request.system_prompt, request.user_prompt)}],
            }],
            "generationConfig": {
                "temperature": request.temperature,
                "maxOutputTokens": request.max_tokens,
            },
        });
        let uri = endpoint(
            &self.base_url,
            &format!("models/{}:generateContent", request.model),
        );
        let auth = self.key.clone().map(|key| ("x-goog-api-key", key));

        let bytes = send_json(&self.client, &uri, auth, &body, self.timeout).await?;
        let response: GeminiResponse = serde_json::from_slice(&bytes)
            .map_err(|e| ProviderCallError::new(format!("Malformed Gemini response: {e}")))?;

        if let Some(reason) = response
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_deref())
        {
            return Err(ProviderCallError::with_status(
                format!("Gemini blocked: {reason}"),
                400,
            ));
        }

        let candidate = response.candidates.first();
        if candidate.and_then(|c| c.finish_reason.as_deref()) == Some("SAFETY") {
            return Err(ProviderCallError::with_status(
                "Gemini safety filter triggered",
                400,
            ));
        }

        let content = candidate
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        Ok(Completion {
            content,
            tokens_in: response.usage_metadata.as_ref().map(|u| u.prompt_token_count),
            tokens_out: response
                .usage_metadata
                .as_ref()
                .map(|u| u.candidates_token_count),
        })
    }
}

fn endpoint(base: &Url, path: &str) -> String {
    format!("{}/{}", base.as_str().trim_end_matches('/'), path)
}

/// Message content is usually a string, but some providers send an array of typed parts.
fn content_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

async fn send_json<T: HttpClient>(
    client: &T,
    uri: &str,
    auth: Option<(&'static str, String)>,
    body: &serde_json::Value,
    timeout: Duration,
) -> Result<axum::body::Bytes, ProviderCallError> {
    let payload = serde_json::to_vec(body)
        .map_err(|e| ProviderCallError::new(format!("Failed to encode request: {e}")))?;

    let mut builder = axum::http::Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some((name, value)) = auth {
        builder = builder.header(name, value);
    }
    let req = builder
        .body(axum::body::Body::from(payload))
        .map_err(|e| ProviderCallError::new(format!("Invalid upstream request: {e}")))?;

    debug!("Sending completion request to {}", redact_query(uri));
    let response = tokio::time::timeout(timeout, client.request(req))
        .await
        .map_err(|_| {
            ProviderCallError::with_status(
                format!("Request timed out after {}s", timeout.as_secs()),
                StatusCode::GATEWAY_TIMEOUT.as_u16(),
            )
        })?
        .map_err(|e| ProviderCallError::new(format!("Request failed: {e}")))?;

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), MAX_RESPONSE_BYTES)
        .await
        .map_err(|e| ProviderCallError::new(format!("Failed to read response body: {e}")))?;

    if !status.is_success() {
        return Err(ProviderCallError::with_status(
            upstream_error_message(status, &bytes),
            status.as_u16(),
        ));
    }
    Ok(bytes)
}

fn redact_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or(uri)
}

/// Pulls a readable message out of an upstream error body.
fn upstream_error_message(status: StatusCode, body: &[u8]) -> String {
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();
    let from_json = parsed.as_ref().and_then(|v| {
        let error = v.get("error")?;
        error
            .get("message")
            .and_then(|m| m.as_str())
            .or_else(|| error.as_str())
            .map(str::to_owned)
    });

    let detail = from_json.unwrap_or_else(|| {
        let text = String::from_utf8_lossy(body);
        text.chars().take(MAX_ERROR_SNIPPET).collect()
    });

    if detail.trim().is_empty() {
        format!("Upstream returned {status}")
    } else {
        format!("Upstream returned {status}: {}", detail.trim())
    }
}
