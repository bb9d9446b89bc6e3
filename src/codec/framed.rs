//! Decoder for pre-framed Opus blobs from the chat-platform voice
//! transport. Each inbound blob is one decodable Opus frame at 48 kHz
//! stereo; there is no container to buffer.

use audiopus::coder::Decoder;
use audiopus::{Channels, MutSignals, SampleRate};

use super::{AudioDecoder, DecodeOutcome, PcmFrame};

/// Largest Opus frame: 120 ms at 48 kHz, per channel.
const MAX_FRAME_SAMPLES: usize = 5_760;

const SAMPLE_RATE: u32 = 48_000;
const CHANNELS: u16 = 2;

/// Decodes platform voice frames (one Opus frame per blob).
pub struct FramedOpusDecoder {
    decoder: Decoder,
}

impl FramedOpusDecoder {
    pub fn new() -> crate::Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz48000, Channels::Stereo)
            .map_err(|e| crate::GatewayError::Codec(format!("opus decoder init: {e}")))?;
        Ok(Self { decoder })
    }
}

impl AudioDecoder for FramedOpusDecoder {
    fn decode(&mut self, bytes: &[u8]) -> DecodeOutcome {
        if bytes.is_empty() {
            return DecodeOutcome::InvalidData;
        }
        let packet = match audiopus::packet::Packet::try_from(bytes) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("rejecting opus frame: {e}");
                return DecodeOutcome::InvalidData;
            }
        };
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES * CHANNELS as usize];
        let signals = match MutSignals::try_from(&mut pcm) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!("opus output buffer: {e}");
                return DecodeOutcome::InvalidData;
            }
        };
        match self.decoder.decode(Some(packet), signals, false) {
            Ok(samples_per_channel) => {
                pcm.truncate(samples_per_channel * CHANNELS as usize);
                DecodeOutcome::Decoded(vec![PcmFrame {
                    samples: pcm,
                    sample_rate: SAMPLE_RATE,
                    channels: CHANNELS,
                }])
            }
            Err(e) => {
                tracing::debug!("opus frame decode failed: {e}");
                DecodeOutcome::InvalidData
            }
        }
    }

    fn begin_utterance(&mut self) {
        // Framed streams carry no cross-blob state; each frame is
        // independently decodable.
    }

    fn output_format(&self) -> (u32, u16) {
        (SAMPLE_RATE, CHANNELS)
    }
}
