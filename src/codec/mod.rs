//! Audio codec adapters for the two ingress transports.
//!
//! Both adapters sit behind [`AudioDecoder`] and turn transport blobs into
//! PCM frames for the STT path. Decode failure is a value, not an error:
//! the utterance state machine branches on [`DecodeOutcome`] and keeps
//! running on bytes it could not decode (the frame still counts as inbound
//! audio for silence detection).

mod container;
mod framed;

pub use container::ContainerOpusDecoder;
pub use framed::FramedOpusDecoder;

/// One decoded block of PCM audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    /// Interleaved signed 16-bit samples.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

impl PcmFrame {
    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        let per_channel = self.samples.len() as u64 / u64::from(self.channels);
        per_channel * 1_000 / u64::from(self.sample_rate)
    }

    /// Samples as little-endian bytes, the layout the STT engine accepts.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }
}

/// Result of feeding one transport blob to a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// Zero or more complete PCM frames were produced.
    Decoded(Vec<PcmFrame>),
    /// The bytes were buffered; a later blob may complete them.
    NeedMoreData,
    /// The accumulated bytes could not be parsed and were discarded.
    /// Container decoders retain their saved header across this.
    InvalidData,
}

/// Streaming decoder from ingress blobs to PCM frames.
///
/// Output sample rate and channel count are constant for the lifetime of
/// a session. `begin_utterance` is the explicit per-turn reset: it clears
/// any partially buffered bytes but must NOT clear state that outlives a
/// turn (the container header in particular).
pub trait AudioDecoder: Send {
    /// Feed one inbound blob.
    fn decode(&mut self, bytes: &[u8]) -> DecodeOutcome;

    /// Reset for a new utterance. Buffered partial data is dropped;
    /// cross-turn state (saved container header) is retained.
    fn begin_utterance(&mut self);

    /// Constant output format `(sample_rate, channels)`.
    fn output_format(&self) -> (u32, u16);
}
