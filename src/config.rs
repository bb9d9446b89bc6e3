//! Configuration types for the voice gateway.
//!
//! One `GatewayConfig` object is loaded at process start; the
//! runtime-tunable subset (silence threshold, chunking strategy, worker
//! caps, error/interruption policies) can be hot-reloaded through a
//! [`ConfigHandle`] without restarting live sessions.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{GatewayError, Result};

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Speaking-turn settings (silence detection, utterance limits).
    pub turn: TurnConfig,
    /// Response streaming pipeline settings.
    pub pipeline: PipelineConfig,
    /// STT engine connection settings.
    pub stt: SttConfig,
    /// TTS engine connection settings.
    pub tts: TtsConfig,
    /// LLM provider endpoints.
    pub llm: LlmConfig,
    /// Conversation store settings.
    pub store: StoreConfig,
    /// Ingress adapter settings.
    pub ingress: IngressConfig,
}

/// Speaking-turn configuration. All fields are runtime-tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Silence duration that triggers finalization, in ms.
    pub silence_threshold_ms: u64,
    /// Hard cap on a single utterance, in ms.
    pub max_utterance_ms: u64,
    /// Transcription language code passed to the STT engine. Fixing the
    /// language skips per-utterance auto-detection in the engine.
    pub language: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 600,
            max_utterance_ms: 45_000,
            language: "en".to_owned(),
        }
    }
}

impl TurnConfig {
    pub fn silence_threshold(&self) -> Duration {
        Duration::from_millis(self.silence_threshold_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }
}

/// How LLM output is split into synthesizable units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingStrategy {
    /// Split on sentence terminators followed by whitespace.
    #[default]
    Sentence,
    /// Split on blank lines; falls back to sentence boundaries inside
    /// long paragraphs.
    Paragraph,
    /// Additionally split on clause punctuation, trading fluency for
    /// lower latency.
    Clause,
    /// Split on whitespace.
    Word,
    /// Split every `fixed_chunk_chars` characters.
    Fixed,
}

/// What to do when one TTS unit fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorStrategy {
    /// Omit the failed unit; neighbours still play.
    Skip,
    /// Retry up to 3 attempts, then skip.
    #[default]
    Retry,
    /// Retry once through a degraded synthesis path, then skip.
    Fallback,
}

/// What to do with in-flight playback when the user interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptionStrategy {
    /// Cancel in-flight synthesis and stop playback now.
    Immediate,
    /// Finish the unit currently playing, then stop.
    #[default]
    Graceful,
    /// Finish everything already queued.
    Drain,
}

/// Response streaming pipeline configuration. All fields are
/// runtime-tunable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Unit extraction strategy.
    pub chunking_strategy: ChunkingStrategy,
    /// Minimum unit length in characters. Range 5–200.
    pub min_chunk_length: usize,
    /// Unit size for [`ChunkingStrategy::Fixed`].
    pub fixed_chunk_chars: usize,
    /// Maximum concurrent TTS synthesis requests. Range 1–8.
    pub max_concurrent_tts: usize,
    /// Per-unit failure policy.
    pub error_strategy: ErrorStrategy,
    /// Interruption policy.
    pub interruption_strategy: InterruptionStrategy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking_strategy: ChunkingStrategy::Sentence,
            min_chunk_length: 10,
            fixed_chunk_chars: 80,
            max_concurrent_tts: 3,
            error_strategy: ErrorStrategy::Retry,
            interruption_strategy: InterruptionStrategy::Graceful,
        }
    }
}

/// STT engine connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// WebSocket URL of the STT engine.
    pub url: String,
    /// Connect deadline in ms.
    pub connect_timeout_ms: u64,
    /// How long to wait for the terminal final after `finalize`, in ms.
    pub finalize_timeout_ms: u64,
    /// Maximum reconnect attempts before the stream is declared dead.
    pub max_reconnect_attempts: u32,
    /// Reconnect backoff base in ms (doubles per attempt).
    pub reconnect_base_ms: u64,
    /// Reconnect backoff cap in ms.
    pub reconnect_cap_ms: u64,
    /// Bound of the in-order audio send queue. A slow engine exerts
    /// backpressure on the ingest task instead of growing memory.
    pub send_queue_frames: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/stt".to_owned(),
            connect_timeout_ms: 2_000,
            finalize_timeout_ms: 2_000,
            max_reconnect_attempts: 3,
            reconnect_base_ms: 1_000,
            reconnect_cap_ms: 10_000,
            send_queue_frames: 64,
        }
    }
}

/// TTS engine connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL of the TTS engine.
    pub url: String,
    /// Per-unit synthesis deadline in ms.
    pub request_timeout_ms: u64,
    /// Maximum attempts per unit under the retry policy.
    pub max_attempts: u32,
    /// Default voice when the agent does not set one.
    pub default_voice: String,
    /// Response container requested from the engine.
    pub response_format: String,
    /// Bytes buffered before playback of a unit begins.
    pub prebuffer_bytes: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000".to_owned(),
            request_timeout_ms: 30_000,
            max_attempts: 3,
            default_voice: "default".to_owned(),
            response_format: "wav".to_owned(),
            prebuffer_bytes: 64 * 1024,
        }
    }
}

/// LLM provider endpoints. Which endpoint a session uses is decided by
/// its agent's provider selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Hosted OpenAI-compatible endpoint.
    pub hosted: OpenAiEndpoint,
    /// Locally hosted OpenAI-compatible endpoint.
    pub local: OpenAiEndpoint,
    /// Webhook endpoint URL.
    pub webhook_url: String,
    /// Whole-request deadline in ms.
    pub request_timeout_ms: u64,
    /// Token budget per response.
    pub max_tokens: u32,
    /// Secondary provider tried once when the primary fails before its
    /// first chunk: one of `hosted`, `local`, `webhook`, or empty for none.
    pub fallback_provider: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            hosted: OpenAiEndpoint {
                base_url: "https://api.openai.com".to_owned(),
                api_key: String::new(),
            },
            local: OpenAiEndpoint {
                base_url: "http://127.0.0.1:8080".to_owned(),
                api_key: String::new(),
            },
            webhook_url: String::new(),
            request_timeout_ms: 30_000,
            max_tokens: 1_024,
            fallback_provider: "local".to_owned(),
        }
    }
}

/// One OpenAI-compatible SSE endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiEndpoint {
    /// Base URL, without the `/v1/chat/completions` suffix.
    pub base_url: String,
    /// Bearer token; empty for unauthenticated local servers.
    pub api_key: String,
}

/// Conversation store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. Empty selects `{data_dir}/voxgate/voxgate.db`.
    pub db_path: String,
    /// Context cache TTL in ms, refreshed on read.
    pub context_cache_ttl_ms: u64,
    /// Most recent messages returned when building prompts.
    pub max_context_messages: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: String::new(),
            context_cache_ttl_ms: 900_000,
            max_context_messages: 40,
        }
    }
}

impl StoreConfig {
    /// Resolve the database path, defaulting into the platform data dir.
    pub fn resolved_db_path(&self) -> PathBuf {
        if !self.db_path.is_empty() {
            return PathBuf::from(&self.db_path);
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxgate")
            .join("voxgate.db")
    }

    pub fn context_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.context_cache_ttl_ms)
    }
}

/// Ingress adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Bind host for the browser WebSocket endpoint.
    pub host: String,
    /// Bind port for the browser WebSocket endpoint.
    pub port: u16,
    /// Idle timeout after which a quiet session is detached, in ms.
    pub idle_timeout_ms: u64,
    /// Whether the chat-platform voice adapter is started.
    pub chat_enabled: bool,
    /// Agent name that chat-platform sessions attach to.
    pub chat_agent: String,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 4900,
            idle_timeout_ms: 600_000,
            chat_enabled: false,
            chat_agent: String::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file, falling back to defaults for
    /// missing sections, then validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("read {}: {e}", path.display())))?;
        let mut config: Self = toml::from_str(&raw)
            .map_err(|e| GatewayError::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Clamp tunables into their documented ranges and reject unusable
    /// endpoint settings.
    pub fn validate(&mut self) -> Result<()> {
        let p = &mut self.pipeline;
        if !(5..=200).contains(&p.min_chunk_length) {
            tracing::warn!(
                min_chunk_length = p.min_chunk_length,
                "min_chunk_length outside 5–200, clamping"
            );
            p.min_chunk_length = p.min_chunk_length.clamp(5, 200);
        }
        if !(1..=8).contains(&p.max_concurrent_tts) {
            tracing::warn!(
                max_concurrent_tts = p.max_concurrent_tts,
                "max_concurrent_tts outside 1–8, clamping"
            );
            p.max_concurrent_tts = p.max_concurrent_tts.clamp(1, 8);
        }
        if p.fixed_chunk_chars == 0 {
            p.fixed_chunk_chars = 80;
        }
        if self.turn.silence_threshold_ms == 0 {
            return Err(GatewayError::Config(
                "silence_threshold_ms must be positive".into(),
            ));
        }
        if self.turn.max_utterance_ms <= self.turn.silence_threshold_ms {
            return Err(GatewayError::Config(
                "max_utterance_ms must exceed silence_threshold_ms".into(),
            ));
        }
        url::Url::parse(&self.stt.url)
            .map_err(|e| GatewayError::Config(format!("stt.url: {e}")))?;
        url::Url::parse(&self.tts.url)
            .map_err(|e| GatewayError::Config(format!("tts.url: {e}")))?;
        Ok(())
    }
}

/// Shared handle over the live configuration.
///
/// Sessions read through this handle at the start of every turn, so a
/// reload takes effect on the next turn without touching in-flight work.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<GatewayConfig>>,
}

impl ConfigHandle {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot of the current configuration.
    pub fn get(&self) -> GatewayConfig {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Re-read the file and swap in the runtime-tunable subset. Endpoint
    /// and store settings keep their boot-time values.
    pub fn reload(&self, path: &Path) -> Result<()> {
        let fresh = GatewayConfig::load(path)?;
        let mut live = self.inner.write().expect("config lock poisoned");
        live.turn = fresh.turn;
        live.pipeline = fresh.pipeline;
        tracing::info!("runtime-tunable configuration reloaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = GatewayConfig::default();
        assert_eq!(c.turn.silence_threshold_ms, 600);
        assert_eq!(c.turn.max_utterance_ms, 45_000);
        assert_eq!(c.pipeline.min_chunk_length, 10);
        assert_eq!(c.pipeline.max_concurrent_tts, 3);
        assert_eq!(c.pipeline.error_strategy, ErrorStrategy::Retry);
        assert_eq!(
            c.pipeline.interruption_strategy,
            InterruptionStrategy::Graceful
        );
        assert_eq!(c.turn.language, "en");
        assert_eq!(c.store.context_cache_ttl_ms, 900_000);
    }

    #[test]
    fn validate_clamps_ranges() {
        let mut c = GatewayConfig::default();
        c.pipeline.min_chunk_length = 1_000;
        c.pipeline.max_concurrent_tts = 99;
        c.validate().expect("validate");
        assert_eq!(c.pipeline.min_chunk_length, 200);
        assert_eq!(c.pipeline.max_concurrent_tts, 8);
    }

    #[test]
    fn validate_rejects_inverted_timers() {
        let mut c = GatewayConfig::default();
        c.turn.max_utterance_ms = 500;
        assert!(c.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: GatewayConfig =
            toml::from_str("[turn]\nsilence_threshold_ms = 450\n").expect("parse");
        assert_eq!(parsed.turn.silence_threshold_ms, 450);
        assert_eq!(parsed.turn.max_utterance_ms, 45_000);
        assert_eq!(parsed.pipeline.max_concurrent_tts, 3);
    }

    #[test]
    fn reload_swaps_only_tunables() {
        let handle = ConfigHandle::new(GatewayConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reload.toml");
        std::fs::write(
            &path,
            "[turn]\nsilence_threshold_ms = 300\n[stt]\nurl = \"ws://other:1/stt\"\n",
        )
        .expect("write");

        handle.reload(&path).expect("reload");
        let live = handle.get();
        assert_eq!(live.turn.silence_threshold_ms, 300);
        // Endpoint settings are boot-time only.
        assert_eq!(live.stt.url, SttConfig::default().url);
    }

    #[test]
    fn strategy_enums_roundtrip_lowercase() {
        let s: ChunkingStrategy = serde_json::from_str("\"clause\"").expect("parse");
        assert_eq!(s, ChunkingStrategy::Clause);
        let e: ErrorStrategy = serde_json::from_str("\"skip\"").expect("parse");
        assert_eq!(e, ErrorStrategy::Skip);
        let i: InterruptionStrategy = serde_json::from_str("\"drain\"").expect("parse");
        assert_eq!(i, InterruptionStrategy::Drain);
    }
}
