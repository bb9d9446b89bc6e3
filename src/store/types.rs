//! Domain entities persisted by the conversation store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

/// Which LLM transport an agent speaks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Hosted OpenAI-compatible SSE endpoint.
    Hosted,
    /// Locally hosted OpenAI-compatible SSE endpoint.
    Local,
    /// Chunked-HTTP webhook.
    Webhook,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hosted => "hosted",
            Self::Local => "local",
            Self::Webhook => "webhook",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hosted" => Ok(Self::Hosted),
            "local" => Ok(Self::Local),
            "webhook" => Ok(Self::Webhook),
            other => Err(GatewayError::Store(format!("unknown provider: {other}"))),
        }
    }
}

/// Voice synthesis parameters stored per agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsParams {
    /// Emotional intensity, 0.25–2.0.
    pub exaggeration: f64,
    /// Pace weight, 0.0–1.0.
    pub cfg_weight: f64,
    /// Sampling temperature, 0.05–5.0.
    pub temperature: f64,
    /// Language code for synthesis.
    pub language: String,
}

impl Default for TtsParams {
    fn default() -> Self {
        Self {
            exaggeration: 0.5,
            cfg_weight: 0.5,
            temperature: 0.8,
            language: "en".to_owned(),
        }
    }
}

/// Configuration for one assistant persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    /// Human name, unique across agents.
    pub name: String,
    pub system_prompt: String,
    pub provider: ProviderKind,
    /// LLM model id. May be empty only for webhook agents: the webhook
    /// picks its own model.
    pub model: String,
    /// LLM sampling temperature.
    pub temperature: f64,
    /// TTS voice id.
    pub tts_voice: String,
    pub tts_params: TtsParams,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub active: bool,
}

impl Agent {
    /// New agent with default voice parameters, not yet persisted.
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        provider: ProviderKind,
        model: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            provider,
            model: model.into(),
            temperature: 0.7,
            tts_voice: "default".to_owned(),
            tts_params: TtsParams::default(),
            created_at: now,
            updated_at: now,
            active: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::Store("agent name must not be empty".into()));
        }
        if self.provider != ProviderKind::Webhook && self.model.trim().is_empty() {
            return Err(GatewayError::Store(format!(
                "agent '{}': model is required for {} provider",
                self.name,
                self.provider.as_str()
            )));
        }
        let p = &self.tts_params;
        if !(0.25..=2.0).contains(&p.exaggeration) {
            return Err(GatewayError::Store("tts exaggeration outside 0.25–2.0".into()));
        }
        if !(0.0..=1.0).contains(&p.cfg_weight) {
            return Err(GatewayError::Store("tts cfg_weight outside 0.0–1.0".into()));
        }
        if !(0.05..=5.0).contains(&p.temperature) {
            return Err(GatewayError::Store("tts temperature outside 0.05–5.0".into()));
        }
        Ok(())
    }
}

/// Which transport a session arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressKind {
    Chat,
    Browser,
}

impl IngressKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Browser => "browser",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "chat" => Ok(Self::Chat),
            "browser" => Ok(Self::Browser),
            other => Err(GatewayError::Store(format!("unknown ingress: {other}"))),
        }
    }
}

/// One live conversation attached to one user on one ingress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// Opaque user id assigned by the ingress.
    pub user_id: String,
    pub agent_id: Uuid,
    pub ingress: IngressKind,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub active: bool,
    pub metadata: serde_json::Value,
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            other => Err(GatewayError::Store(format!("unknown role: {other}"))),
        }
    }
}

/// Timings recorded against a turn's messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnLatency {
    /// Duration of the user's audio, ms.
    pub user_audio_ms: Option<u64>,
    /// Duration of the synthesized reply, ms.
    pub assistant_audio_ms: Option<u64>,
    /// Time to the LLM's first chunk, ms.
    pub llm_first_chunk_ms: Option<u64>,
    /// Whole-turn latency, ms.
    pub total_turn_ms: Option<u64>,
}

impl TurnLatency {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// One logical message in a session. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Strictly increasing by insertion order within the store.
    pub id: i64,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub latency: Option<TurnLatency>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_agent_may_omit_model() {
        let agent = Agent::new("hooked", "You are terse.", ProviderKind::Webhook, "");
        agent.validate().expect("webhook without model is valid");
    }

    #[test]
    fn hosted_agent_requires_model() {
        let agent = Agent::new("hosted", "You are terse.", ProviderKind::Hosted, "");
        assert!(agent.validate().is_err());
    }

    #[test]
    fn tts_param_ranges_enforced() {
        let mut agent = Agent::new("a", "p", ProviderKind::Local, "m");
        agent.tts_params.exaggeration = 3.0;
        assert!(agent.validate().is_err());
        agent.tts_params.exaggeration = 1.0;
        agent.tts_params.cfg_weight = 1.5;
        assert!(agent.validate().is_err());
    }

    #[test]
    fn enums_roundtrip() {
        assert_eq!(
            ProviderKind::parse(ProviderKind::Webhook.as_str()).expect("parse"),
            ProviderKind::Webhook
        );
        assert_eq!(
            IngressKind::parse(IngressKind::Browser.as_str()).expect("parse"),
            IngressKind::Browser
        );
        assert_eq!(Role::parse(Role::Assistant.as_str()).expect("parse"), Role::Assistant);
        assert!(Role::parse("narrator").is_err());
    }
}
