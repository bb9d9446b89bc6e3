//! Webhook provider adapter.
//!
//! The webhook receives one chunked HTTP POST per turn and streams its
//! reply back in whichever body format it prefers: `text/event-stream`
//! (parsed as SSE data payloads), plain chunked text (passed through as
//! chunks), or a single JSON object (legacy). An optional `X-TTS-Options`
//! response header carries per-request voice overrides.

use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use serde_json::json;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::health::ServiceHealth;

use super::sse::SseParser;
use super::{GenerateRequest, LlmProvider, TokenStream, TtsOverrides};

/// Response header carrying per-request voice overrides.
const TTS_OPTIONS_HEADER: &str = "x-tts-options";

pub struct WebhookProvider {
    url: String,
    http: reqwest::Client,
}

impl WebhookProvider {
    pub fn new(url: String, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self { url, http }
    }

    /// The webhook sees only the newest user text; it keeps its own
    /// conversation state keyed by `userId`.
    fn build_body(request: &GenerateRequest) -> serde_json::Value {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, crate::store::types::Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        json!({
            "text": text,
            "userId": request.user_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "useStreaming": true,
        })
    }
}

impl std::fmt::Debug for WebhookProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookProvider").field("url", &self.url).finish()
    }
}

/// Pull the reply text out of a legacy JSON body.
fn legacy_json_text(body: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_str(body).ok()?;
    for key in ["text", "response", "message"] {
        if let Some(s) = parsed.get(key).and_then(serde_json::Value::as_str) {
            return Some(s.to_owned());
        }
    }
    None
}

/// SSE data payloads may be bare text or a small JSON envelope.
fn sse_chunk_text(data: &str) -> Option<String> {
    if data.trim().is_empty() {
        return None;
    }
    if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(data) {
        for key in ["text", "content", "delta"] {
            if let Some(s) = parsed.get(key).and_then(serde_json::Value::as_str) {
                return (!s.is_empty()).then(|| s.to_owned());
            }
        }
        // JSON without a recognized field carries no speakable text.
        return None;
    }
    Some(data.to_owned())
}

#[async_trait::async_trait]
impl LlmProvider for WebhookProvider {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream> {
        if self.url.is_empty() {
            return Err(GatewayError::Config("webhook URL not configured".into()));
        }

        let resp = self
            .http
            .post(&self.url)
            .json(&Self::build_body(request))
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("webhook: request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Llm(format!("webhook: HTTP {status}: {body}")));
        }

        let overrides = resp
            .headers()
            .get(TTS_OPTIONS_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|raw| match serde_json::from_str::<TtsOverrides>(raw) {
                Ok(o) => Some(o),
                Err(e) => {
                    debug!("ignoring malformed {TTS_OPTIONS_HEADER} header: {e}");
                    None
                }
            });

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();

        if content_type.starts_with("application/json") {
            // Legacy: the whole reply arrives as one JSON object.
            let body = resp
                .text()
                .await
                .map_err(|e| GatewayError::Llm(format!("webhook: body: {e}")))?;
            let text = legacy_json_text(&body)
                .ok_or_else(|| GatewayError::Protocol("webhook JSON reply has no text".into()))?;
            return Ok(TokenStream::new(futures_util::stream::once(async move {
                Ok(text)
            }))
            .with_overrides(overrides));
        }

        let is_sse = content_type.starts_with("text/event-stream");
        let mut bytes = resp.bytes_stream();
        let chunks = stream! {
            let mut parser = SseParser::new();
            'body: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GatewayError::Llm(format!("webhook: body: {e}")));
                        break 'body;
                    }
                };
                if is_sse {
                    for event in parser.push(&chunk) {
                        if event.is_done() {
                            break 'body;
                        }
                        if let Some(text) = sse_chunk_text(&event.data) {
                            yield Ok(text);
                        }
                    }
                } else {
                    // Plain chunked text: each transfer chunk is a token
                    // chunk as-is.
                    let text = String::from_utf8_lossy(&chunk).into_owned();
                    if !text.is_empty() {
                        yield Ok(text);
                    }
                }
            }
            if is_sse
                && let Some(event) = parser.finish()
                && !event.is_done()
                && let Some(text) = sse_chunk_text(&event.data)
            {
                yield Ok(text);
            }
        };
        Ok(TokenStream::new(chunks).with_overrides(overrides))
    }

    async fn health(&self) -> ServiceHealth {
        if self.url.is_empty() {
            return ServiceHealth::Down;
        }
        match self.http.head(&self.url).send().await {
            Ok(resp) if resp.status().is_client_error() => ServiceHealth::Degraded,
            Ok(_) => ServiceHealth::Ok,
            Err(_) => ServiceHealth::Down,
        }
    }
}
