//! LLM provider abstraction.
//!
//! All providers normalize to one contract: a message list plus agent
//! sampling options in, a lazy sequence of text chunks out. Transport
//! differences (hosted SSE, locally hosted SSE, webhook chunked POST)
//! live entirely inside the adapters; timeouts and retries never leak to
//! callers.

pub mod fallback;
pub mod openai;
pub mod sse;
pub mod webhook;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, stream};

use crate::config::LlmConfig;
use crate::error::Result;
use crate::health::ServiceHealth;
use crate::metrics::Metrics;
use crate::store::types::{ProviderKind, Role};

/// One prompt message, in order.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One generation request.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// System prompt + recent history + the new user text, in order.
    pub messages: Vec<ChatMessage>,
    /// Model id from the agent record. Empty for webhook agents.
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// Opaque user id, forwarded to providers that want attribution.
    pub user_id: String,
}

/// Per-request TTS overrides a webhook may attach via `X-TTS-Options`.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct TtsOverrides {
    pub voice: Option<String>,
    pub exaggeration: Option<f64>,
    pub cfg_weight: Option<f64>,
    pub temperature: Option<f64>,
}

/// Lazy, finite, non-restartable sequence of text chunks.
pub struct TokenStream {
    inner: Pin<Box<dyn Stream<Item = Result<String>> + Send>>,
    /// Set by the webhook adapter when the response carried overrides.
    pub tts_overrides: Option<TtsOverrides>,
}

impl TokenStream {
    pub fn new(inner: impl Stream<Item = Result<String>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(inner),
            tts_overrides: None,
        }
    }

    pub fn with_overrides(mut self, overrides: Option<TtsOverrides>) -> Self {
        self.tts_overrides = overrides;
        self
    }

    /// Next text chunk, or `None` at end of generation.
    pub async fn next_chunk(&mut self) -> Option<Result<String>> {
        self.inner.next().await
    }

    /// Put an already-consumed chunk back at the front. Used by the
    /// fallback wrapper, which peeks the first chunk to decide whether
    /// the primary provider has committed.
    pub fn prepend(self, chunk: String) -> Self {
        let overrides = self.tts_overrides.clone();
        Self {
            inner: Box::pin(stream::once(async move { Ok(chunk) }).chain(self.inner)),
            tts_overrides: overrides,
        }
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("tts_overrides", &self.tts_overrides)
            .finish_non_exhaustive()
    }
}

/// Common provider contract.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable adapter name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Start a generation. The returned stream is lazy; the first chunk
    /// commits the observer (no fallback past it).
    async fn generate_stream(&self, request: &GenerateRequest) -> Result<TokenStream>;

    /// Best-effort engine probe.
    async fn health(&self) -> ServiceHealth;
}

/// Build the provider for an agent's selector, wrapped in the configured
/// fallback chain.
pub fn provider_for(
    kind: ProviderKind,
    config: &LlmConfig,
    metrics: Arc<Metrics>,
) -> Arc<dyn LlmProvider> {
    let primary = bare_provider(kind, config);
    let secondary = match config.fallback_provider.as_str() {
        "" => None,
        name => match ProviderKind::parse(name) {
            Ok(k) if k != kind => Some(bare_provider(k, config)),
            Ok(_) => None,
            Err(_) => {
                tracing::warn!(fallback = name, "unknown fallback provider, disabling");
                None
            }
        },
    };
    match secondary {
        Some(secondary) => Arc::new(fallback::FallbackProvider::new(primary, secondary, metrics)),
        None => primary,
    }
}

fn bare_provider(kind: ProviderKind, config: &LlmConfig) -> Arc<dyn LlmProvider> {
    match kind {
        ProviderKind::Hosted => Arc::new(openai::OpenAiSseProvider::hosted(
            config.hosted.clone(),
            config.request_timeout_ms,
        )),
        ProviderKind::Local => Arc::new(openai::OpenAiSseProvider::local(
            config.local.clone(),
            config.request_timeout_ms,
        )),
        ProviderKind::Webhook => Arc::new(webhook::WebhookProvider::new(
            config.webhook_url.clone(),
            config.request_timeout_ms,
        )),
    }
}
