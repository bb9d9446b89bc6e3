//! Streaming speech-to-text client.
//!
//! Wraps the engine's bidirectional WebSocket in an ordered, reconnecting
//! stream: audio frames go out strictly in arrival order through a bounded
//! queue (a slow engine backpressures the ingest task instead of growing
//! memory), partial and final transcripts come back as a lazy event
//! sequence, and `finalize` is idempotent.

mod client;

pub use client::{SttClient, SttStream};

use serde::Deserialize;

/// Audio payload format declared in the stream's first message. The
/// engine routes frames to different decoders based on it; once set per
/// stream it never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// Raw Opus frames (chat-platform ingress).
    OpusFrames,
    /// 16-bit little-endian PCM mono at 16 kHz (browser ingress after
    /// server-side decode).
    Pcm16k,
}

impl AudioFormat {
    /// Wire name used in the `start` message.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::OpusFrames => "opus",
            Self::Pcm16k => "pcm",
        }
    }
}

/// One event from the engine. Finite per stream: after one `Final` the
/// stream is terminal for the utterance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    /// The engine acknowledged `start` and accepts audio.
    Ready,
    /// An interim transcript; later partials supersede earlier ones.
    Partial(String),
    /// The authoritative transcript. Emitted at most once.
    Final(String),
    /// The engine reported an error for this stream.
    EngineError(String),
    /// The transport dropped before a final was received.
    Disconnected(String),
}

/// Inbound wire messages from the engine.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub(crate) enum ServerMessage {
    Ready,
    Partial { text: String },
    Final { text: String },
    Error { error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_engine_contract() {
        assert_eq!(AudioFormat::OpusFrames.wire_name(), "opus");
        assert_eq!(AudioFormat::Pcm16k.wire_name(), "pcm");
    }

    #[test]
    fn server_messages_parse() {
        let msg: ServerMessage = serde_json::from_str(r#"{"type":"ready"}"#).expect("parse");
        assert!(matches!(msg, ServerMessage::Ready));
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"partial","text":"hel"}"#).expect("parse");
        assert!(matches!(msg, ServerMessage::Partial { text } if text == "hel"));
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"final","text":"hello"}"#).expect("parse");
        assert!(matches!(msg, ServerMessage::Final { text } if text == "hello"));
        let msg: ServerMessage =
            serde_json::from_str(r#"{"type":"error","error":"overloaded"}"#).expect("parse");
        assert!(matches!(msg, ServerMessage::Error { error } if error == "overloaded"));
    }
}
