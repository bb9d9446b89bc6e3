//! OpenAI-compatible SSE provider adapter.
//!
//! Serves both the hosted endpoint and a locally hosted server; the two
//! differ only in base URL and whether an authorization header is sent.
//! The wire format is `POST /v1/chat/completions` with `stream: true`,
//! answered by `data:`-framed SSE deltas terminated by `data: [DONE]`.

use std::time::Duration;

use async_stream::stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::OpenAiEndpoint;
use crate::error::{GatewayError, Result};
use crate::health::ServiceHealth;
use crate::store::types::Role;

use super::sse::SseParser;
use super::{GenerateRequest, LlmProvider, TokenStream};

/// Streaming chat-completions adapter.
pub struct OpenAiSseProvider {
    name: &'static str,
    endpoint: OpenAiEndpoint,
    http: reqwest::Client,
}

impl OpenAiSseProvider {
    pub fn hosted(endpoint: OpenAiEndpoint, timeout_ms: u64) -> Self {
        Self::with_name("hosted", endpoint, timeout_ms)
    }

    pub fn local(endpoint: OpenAiEndpoint, timeout_ms: u64) -> Self {
        Self::with_name("local", endpoint, timeout_ms)
    }

    fn with_name(name: &'static str, endpoint: OpenAiEndpoint, timeout_ms: u64) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .unwrap_or_default();
        Self {
            name,
            endpoint,
            http,
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }

    fn build_body(request: &GenerateRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": m.content,
                })
            })
            .collect();
        json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
        })
    }
}

impl std::fmt::Debug for OpenAiSseProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiSseProvider")
            .field("name", &self.name)
            .field("base_url", &self.endpoint.base_url)
            .finish()
    }
}

/// The slice of a streaming completion event we care about.
#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the text delta from one SSE data payload.
fn delta_text(data: &str) -> Option<String> {
    let parsed: StreamChunk = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            debug!("skipping unparseable stream event: {e}");
            return None;
        }
    };
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|s| !s.is_empty())
}

#[async_trait::async_trait]
impl LlmProvider for OpenAiSseProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream> {
        let mut req = self
            .http
            .post(self.completions_url())
            .json(&Self::build_body(request));
        if !self.endpoint.api_key.is_empty() {
            req = req.bearer_auth(&self.endpoint.api_key);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Llm(format!("{}: request: {e}", self.name)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Llm(format!(
                "{}: HTTP {status}: {body}",
                self.name
            )));
        }

        let name = self.name;
        let mut bytes = resp.bytes_stream();
        let chunks = stream! {
            let mut parser = SseParser::new();
            'body: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(GatewayError::Llm(format!("{name}: body: {e}")));
                        break 'body;
                    }
                };
                for event in parser.push(&chunk) {
                    if event.is_done() {
                        break 'body;
                    }
                    if let Some(text) = delta_text(&event.data) {
                        yield Ok(text);
                    }
                }
            }
            if let Some(event) = parser.finish() {
                if !event.is_done()
                    && let Some(text) = delta_text(&event.data)
                {
                    yield Ok(text);
                }
            }
        };
        Ok(TokenStream::new(chunks))
    }

    async fn health(&self) -> ServiceHealth {
        // Listing models is the cheapest authenticated round trip the
        // compatible servers all implement.
        let url = format!("{}/v1/models", self.endpoint.base_url.trim_end_matches('/'));
        let mut req = self.http.get(&url);
        if !self.endpoint.api_key.is_empty() {
            req = req.bearer_auth(&self.endpoint.api_key);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => ServiceHealth::Ok,
            Ok(_) => ServiceHealth::Degraded,
            Err(_) => ServiceHealth::Down,
        }
    }
}
