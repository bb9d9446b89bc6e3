//! Streaming text-to-speech client.
//!
//! Synthesizes one text unit per request and exposes the response body as
//! a lazy byte stream, so playback can begin after a small prebuffer
//! instead of waiting for the full file. Failed units are retried with
//! backoff and ultimately skipped by the pipeline; a skip is a visible
//! degradation, not an error.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use tracing::{debug, warn};

use crate::config::TtsConfig;
use crate::error::{GatewayError, Result};
use crate::health::ServiceHealth;

/// Voice parameters for one agent, applied per request.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// Engine voice id.
    pub voice: String,
    /// Emotional intensity, 0.25–2.0.
    pub exaggeration: f64,
    /// Pace weight, 0.0–1.0.
    pub cfg_weight: f64,
    /// Sampling temperature, 0.05–5.0.
    pub temperature: f64,
    /// Playback speed multiplier.
    pub speed: f64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            voice: "default".to_owned(),
            exaggeration: 0.5,
            cfg_weight: 0.5,
            temperature: 0.8,
            speed: 1.0,
        }
    }
}

/// Lazy synthesized-audio byte stream. Finite, non-restartable.
pub struct AudioStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl AudioStream {
    /// Next chunk of audio bytes, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes>> {
        self.inner.next().await
    }

    /// Drain the whole stream into one buffer. Test and metering helper;
    /// production playback consumes chunks progressively.
    pub async fn collect(mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

/// HTTP client for the TTS engine.
#[derive(Debug, Clone)]
pub struct TtsClient {
    http: reqwest::Client,
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Bytes to buffer before playback of a unit begins.
    pub fn prebuffer_bytes(&self) -> usize {
        self.config.prebuffer_bytes
    }

    /// Configured attempt cap for the retry policy.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Synthesize one unit. Single attempt; callers pick the retry policy.
    pub async fn synthesize(&self, text: &str, voice: &VoiceConfig) -> Result<AudioStream> {
        self.request(text, voice, None).await
    }

    /// Synthesize with up to `attempts` tries and jittered backoff.
    pub async fn synthesize_with_retry(
        &self,
        text: &str,
        voice: &VoiceConfig,
        attempts: u32,
    ) -> Result<AudioStream> {
        let attempts = attempts.max(1);
        let mut delay = Duration::from_millis(250);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.request(text, voice, None).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    warn!(attempt, error = %e, "TTS synthesis attempt failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        let jitter =
                            rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                        tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| GatewayError::Tts("no attempts made".into())))
    }

    /// Degraded synthesis path: fast quality, engine default voice. Used
    /// by the `fallback` error policy before giving up on a unit.
    pub async fn synthesize_degraded(&self, text: &str) -> Result<AudioStream> {
        let voice = VoiceConfig {
            voice: self.config.default_voice.clone(),
            ..VoiceConfig::default()
        };
        self.request(text, &voice, Some("fast")).await
    }

    /// Probe the engine.
    pub async fn health(&self) -> ServiceHealth {
        let url = format!("{}/health", self.config.url.trim_end_matches('/'));
        match self.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => ServiceHealth::Ok,
            Ok(resp) => {
                debug!(status = %resp.status(), "TTS health probe degraded");
                ServiceHealth::Degraded
            }
            Err(e) => {
                debug!("TTS health probe failed: {e}");
                ServiceHealth::Down
            }
        }
    }

    async fn request(
        &self,
        text: &str,
        voice: &VoiceConfig,
        quality: Option<&str>,
    ) -> Result<AudioStream> {
        let url = format!("{}/synthesize", self.config.url.trim_end_matches('/'));
        let mut form: Vec<(&str, String)> = vec![
            ("input", text.to_owned()),
            ("voice", voice.voice.clone()),
            ("response_format", self.config.response_format.clone()),
            ("speed", voice.speed.to_string()),
            ("temperature", voice.temperature.to_string()),
            ("exaggeration", voice.exaggeration.to_string()),
            ("cfg_weight", voice.cfg_weight.to_string()),
        ];
        if let Some(q) = quality {
            form.push(("streaming_quality", q.to_owned()));
        }

        let resp = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::Tts(format!("request: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(GatewayError::Tts(format!("HTTP {status}: {body}")));
        }

        let inner = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| GatewayError::Tts(format!("body: {e}"))));
        Ok(AudioStream {
            inner: Box::pin(inner),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_voice_is_sane() {
        let v = VoiceConfig::default();
        assert!((0.25..=2.0).contains(&v.exaggeration));
        assert!((0.0..=1.0).contains(&v.cfg_weight));
        assert!((0.05..=5.0).contains(&v.temperature));
    }
}
