//! Ingress adapters and the uniform core contract they feed.
//!
//! An adapter translates one transport (chat-platform voice, browser
//! WebSocket) into [`IngressEvent`]s and exposes an [`AudioSink`] for
//! synthesized audio plus an [`EventSink`] for the JSON event stream.
//! Adapters know nothing about LLM or TTS.

pub mod chat;
pub mod ws;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Uniform inbound event delivered to the session supervisor.
#[derive(Debug, Clone)]
pub enum IngressEvent {
    /// A speaker began talking. `user_id` is the transport's opaque id.
    SpeakerStart { user_id: String },
    /// One compressed audio blob.
    Audio { user_id: String, frame: Bytes },
    /// The transport believes the speaker stopped. A hint; silence
    /// detection still governs finalization.
    SpeakerEnd { user_id: String },
    /// The transport disconnected; the session subtree is cancelled.
    Disconnect,
}

/// Outbound JSON events on the browser WebSocket.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PartialTranscript { text: String },
    FinalTranscript { text: String },
    AiResponseChunk { text: String },
    AiResponseComplete,
    TtsStart,
    TtsComplete,
    ServiceError { message: String },
    /// Silence detection finished the utterance; the connection persists.
    StopListening,
    BotSpeakingStateChanged { speaking: bool },
}

/// Where synthesized audio goes. Implementations stream progressively;
/// `play` is called repeatedly with body chunks, in playback order.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn play(&self, audio: Bytes) -> Result<()>;
}

/// Where session events go. Chat-platform sessions use [`NullEventSink`];
/// the transport has no event channel.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: SessionEvent) -> Result<()>;
}

/// Event sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: SessionEvent) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_snake_cased() {
        let json = serde_json::to_string(&SessionEvent::FinalTranscript {
            text: "hi".to_owned(),
        })
        .expect("serialize");
        assert_eq!(json, r#"{"type":"final_transcript","text":"hi"}"#);

        let json = serde_json::to_string(&SessionEvent::BotSpeakingStateChanged { speaking: true })
            .expect("serialize");
        assert_eq!(
            json,
            r#"{"type":"bot_speaking_state_changed","speaking":true}"#
        );
    }

    #[test]
    fn unit_events_have_no_payload() {
        let json = serde_json::to_string(&SessionEvent::AiResponseComplete).expect("serialize");
        assert_eq!(json, r#"{"type":"ai_response_complete"}"#);
    }
}
