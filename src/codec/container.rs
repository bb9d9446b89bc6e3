//! Decoder for streaming-Opus container chunks from the browser recorder.
//!
//! Browser recorders emit the container header (identification and
//! comment pages) once, at the start of the recording. Later turns on the
//! same connection arrive header-less, so the adapter saves the header
//! bytes observed on the first successful parse and prepends them when
//! decoding every subsequent utterance. Without that, turn 2 audio would
//! be rejected wholesale.
//!
//! Chunk boundaries are arbitrary: a blob may end mid-page. Incomplete
//! trailing bytes are buffered and retried on the next blob. Invalid data
//! resets the utterance buffer but never the saved header.

use std::io::Cursor;

use audiopus::coder::Decoder;
use audiopus::{Channels, MutSignals, SampleRate};

use super::{AudioDecoder, DecodeOutcome, PcmFrame};

/// Output rate for the STT path. Opus decodes natively at 16 kHz, so no
/// separate resampling stage exists.
const SAMPLE_RATE: u32 = 16_000;
const CHANNELS: u16 = 1;

/// Largest Opus frame: 120 ms at 16 kHz mono.
const MAX_FRAME_SAMPLES: usize = 1_920;

/// Ogg page header: magic(4) version(1) type(1) granule(8) serial(4)
/// sequence(4) crc(4) segment-count(1).
const PAGE_HEADER_LEN: usize = 27;

/// Identification/comment packets occupy one logical packet each.
const HEADER_PACKETS: usize = 2;

/// Decodes streaming-Opus container chunks to 16 kHz mono PCM.
pub struct ContainerOpusDecoder {
    decoder: Decoder,
    /// Container header bytes (identification + comment pages), captured
    /// on the first successful parse and retained for the session.
    header: Option<Vec<u8>>,
    /// Bytes of the current utterance, excluding the saved header.
    buf: Vec<u8>,
    /// Audio packets already decoded for the current utterance. Each
    /// attempt re-parses from the start of the utterance and skips these.
    packets_emitted: usize,
}

impl ContainerOpusDecoder {
    pub fn new() -> crate::Result<Self> {
        let decoder = Decoder::new(SampleRate::Hz16000, Channels::Mono)
            .map_err(|e| crate::GatewayError::Codec(format!("opus decoder init: {e}")))?;
        Ok(Self {
            decoder,
            header: None,
            buf: Vec::new(),
            packets_emitted: 0,
        })
    }

    /// Whether the container header has been captured.
    pub fn has_header(&self) -> bool {
        self.header.is_some()
    }

    fn reset_utterance_buffer(&mut self) {
        self.buf.clear();
        self.packets_emitted = 0;
    }

    /// Try to capture the header span from the complete pages in `data`.
    /// Returns the header length when both header pages are present.
    fn capture_header_span(data: &[u8], complete_len: usize) -> Option<HeaderScan> {
        let mut offset = 0;
        let mut saw_head = false;
        let mut saw_tags = false;
        while offset < complete_len {
            let page = PageView::parse(&data[offset..complete_len])?;
            let payload = page.payload(&data[offset..]);
            if !saw_head {
                if !payload.starts_with(b"OpusHead") {
                    return Some(HeaderScan::NotOpus);
                }
                saw_head = true;
            } else if payload.starts_with(b"OpusTags") || page.is_continuation {
                saw_tags = true;
                // OpusTags may span pages; keep consuming continuations.
                if !page.ends_mid_packet {
                    return Some(HeaderScan::Captured(offset + page.len));
                }
            } else {
                // Audio page before a complete comment header.
                return Some(HeaderScan::NotOpus);
            }
            offset += page.len;
        }
        if saw_head && saw_tags {
            Some(HeaderScan::Captured(complete_len))
        } else {
            None
        }
    }

    /// Decode all not-yet-emitted audio packets in `data[..complete_len]`.
    fn decode_new_packets(&mut self, data: &[u8], complete_len: usize) -> Option<Vec<PcmFrame>> {
        let mut reader = ogg::PacketReader::new(Cursor::new(&data[..complete_len]));
        let mut index = 0usize;
        let mut frames = Vec::new();
        loop {
            match reader.read_packet() {
                Ok(Some(packet)) => {
                    index += 1;
                    if index <= HEADER_PACKETS + self.packets_emitted {
                        continue;
                    }
                    // Zero-length packets are DTX; they carry no PCM.
                    if packet.data.is_empty() {
                        self.packets_emitted += 1;
                        continue;
                    }
                    let opus = match audiopus::packet::Packet::try_from(&packet.data[..]) {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::debug!("rejecting container packet: {e}");
                            return None;
                        }
                    };
                    let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
                    let signals = match MutSignals::try_from(&mut pcm) {
                        Ok(s) => s,
                        Err(_) => return None,
                    };
                    match self.decoder.decode(Some(opus), signals, false) {
                        Ok(n) => {
                            pcm.truncate(n);
                            frames.push(PcmFrame {
                                samples: pcm,
                                sample_rate: SAMPLE_RATE,
                                channels: CHANNELS,
                            });
                            self.packets_emitted += 1;
                        }
                        Err(e) => {
                            tracing::debug!("container opus decode failed: {e}");
                            return None;
                        }
                    }
                }
                Ok(None) => break,
                Err(ogg::OggReadError::ReadError(ref io))
                    if io.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    // A packet continues into a page we have not seen yet.
                    break;
                }
                Err(e) => {
                    tracing::debug!("container parse failed: {e}");
                    return None;
                }
            }
        }
        Some(frames)
    }
}

enum HeaderScan {
    Captured(usize),
    NotOpus,
}

/// Minimal view over one Ogg page for span scanning. CRC validation is
/// left to the packet reader.
struct PageView {
    len: usize,
    is_continuation: bool,
    ends_mid_packet: bool,
}

impl PageView {
    fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < PAGE_HEADER_LEN {
            return None;
        }
        if &data[..4] != b"OggS" {
            return None;
        }
        let seg_count = data[26] as usize;
        let table_end = PAGE_HEADER_LEN + seg_count;
        if data.len() < table_end {
            return None;
        }
        let payload_len: usize = data[PAGE_HEADER_LEN..table_end]
            .iter()
            .map(|&b| b as usize)
            .sum();
        let len = table_end + payload_len;
        if data.len() < len {
            return None;
        }
        Some(Self {
            len,
            is_continuation: data[5] & 0x01 != 0,
            // A final lacing value of 255 means the last packet continues
            // on the next page.
            ends_mid_packet: seg_count > 0 && data[table_end - 1] == 255,
        })
    }

    fn payload<'a>(&self, page: &'a [u8]) -> &'a [u8] {
        let table_end = self.len - self.payload_len(page);
        &page[table_end..self.len]
    }

    fn payload_len(&self, page: &[u8]) -> usize {
        let seg_count = page[26] as usize;
        page[PAGE_HEADER_LEN..PAGE_HEADER_LEN + seg_count]
            .iter()
            .map(|&b| b as usize)
            .sum()
    }
}

/// Length of the leading run of complete pages, or `None` when the data
/// at a page boundary is not an Ogg page.
fn complete_page_span(data: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while offset < data.len() {
        let rest = &data[offset..];
        if rest.len() >= 4 && &rest[..4] != b"OggS" {
            return None;
        }
        match PageView::parse(rest) {
            Some(page) => offset += page.len,
            None => break,
        }
    }
    Some(offset)
}

impl AudioDecoder for ContainerOpusDecoder {
    fn decode(&mut self, bytes: &[u8]) -> DecodeOutcome {
        self.buf.extend_from_slice(bytes);

        // Feed = saved header (if any) + utterance bytes, so the packet
        // reader always sees a well-formed stream start.
        let full: Vec<u8> = match &self.header {
            Some(header) => {
                let mut v = Vec::with_capacity(header.len() + self.buf.len());
                v.extend_from_slice(header);
                v.extend_from_slice(&self.buf);
                v
            }
            None => self.buf.clone(),
        };

        let Some(complete_len) = complete_page_span(&full) else {
            self.reset_utterance_buffer();
            return DecodeOutcome::InvalidData;
        };
        if complete_len == 0 {
            return DecodeOutcome::NeedMoreData;
        }

        if self.header.is_none() {
            match Self::capture_header_span(&full, complete_len) {
                Some(HeaderScan::Captured(span)) => {
                    self.header = Some(full[..span].to_vec());
                    self.buf.drain(..span);
                    tracing::debug!(header_bytes = span, "container header captured");
                }
                Some(HeaderScan::NotOpus) => {
                    self.reset_utterance_buffer();
                    return DecodeOutcome::InvalidData;
                }
                // Header pages incomplete; wait for more bytes.
                None => return DecodeOutcome::NeedMoreData,
            }
        }

        // Rebuild the feed if the header was just captured out of `buf`.
        let full: Vec<u8> = {
            let header = self.header.as_deref().unwrap_or_default();
            let mut v = Vec::with_capacity(header.len() + self.buf.len());
            v.extend_from_slice(header);
            v.extend_from_slice(&self.buf);
            v
        };
        let Some(complete_len) = complete_page_span(&full) else {
            self.reset_utterance_buffer();
            return DecodeOutcome::InvalidData;
        };

        match self.decode_new_packets(&full, complete_len) {
            Some(frames) if frames.is_empty() => DecodeOutcome::NeedMoreData,
            Some(frames) => DecodeOutcome::Decoded(frames),
            None => {
                self.reset_utterance_buffer();
                DecodeOutcome::InvalidData
            }
        }
    }

    fn begin_utterance(&mut self) {
        // The saved header survives turns; buffered page fragments do not.
        self.reset_utterance_buffer();
    }

    fn output_format(&self) -> (u32, u16) {
        (SAMPLE_RATE, CHANNELS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiopus::Application;
    use audiopus::coder::Encoder;

    /// Ogg CRC32: polynomial 0x04C11DB7, no reflection, zero init.
    fn ogg_crc(data: &[u8]) -> u32 {
        let mut crc: u32 = 0;
        for &b in data {
            crc ^= u32::from(b) << 24;
            for _ in 0..8 {
                crc = if crc & 0x8000_0000 != 0 {
                    (crc << 1) ^ 0x04C1_1DB7
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    /// Build one Ogg page holding the given packets (each must fit in a
    /// single page for test purposes).
    fn build_page(header_type: u8, granule: u64, seq: u32, packets: &[&[u8]]) -> Vec<u8> {
        let mut lacing = Vec::new();
        let mut payload = Vec::new();
        for p in packets {
            assert!(p.len() < 255, "test packets must use a single segment");
            lacing.push(p.len() as u8);
            payload.extend_from_slice(p);
        }
        let mut page = Vec::new();
        page.extend_from_slice(b"OggS");
        page.push(0); // version
        page.push(header_type);
        page.extend_from_slice(&granule.to_le_bytes());
        page.extend_from_slice(&0x4D5Au32.to_le_bytes()); // serial
        page.extend_from_slice(&seq.to_le_bytes());
        page.extend_from_slice(&[0, 0, 0, 0]); // crc placeholder
        page.push(lacing.len() as u8);
        page.extend_from_slice(&lacing);
        page.extend_from_slice(&payload);
        let crc = ogg_crc(&page);
        page[22..26].copy_from_slice(&crc.to_le_bytes());
        page
    }

    fn opus_head() -> Vec<u8> {
        let mut head = Vec::new();
        head.extend_from_slice(b"OpusHead");
        head.push(1); // version
        head.push(1); // channels
        head.extend_from_slice(&312u16.to_le_bytes()); // pre-skip
        head.extend_from_slice(&16_000u32.to_le_bytes()); // input rate
        head.extend_from_slice(&0u16.to_le_bytes()); // gain
        head.push(0); // mapping family
        head
    }

    fn opus_tags() -> Vec<u8> {
        let mut tags = Vec::new();
        tags.extend_from_slice(b"OpusTags");
        tags.extend_from_slice(&7u32.to_le_bytes());
        tags.extend_from_slice(b"voxgate");
        tags.extend_from_slice(&0u32.to_le_bytes());
        tags
    }

    fn header_pages() -> Vec<u8> {
        let mut bytes = build_page(0x02, 0, 0, &[&opus_head()]);
        bytes.extend_from_slice(&build_page(0x00, 0, 1, &[&opus_tags()]));
        bytes
    }

    /// Encode 20 ms of a quiet tone into one real Opus packet.
    fn encoded_packet() -> Vec<u8> {
        let encoder =
            Encoder::new(SampleRate::Hz16000, Channels::Mono, Application::Voip).expect("encoder");
        let pcm: Vec<i16> = (0..320)
            .map(|i| ((i as f32 * 0.2).sin() * 1_000.0) as i16)
            .collect();
        let mut out = vec![0u8; 4_000];
        let len = encoder.encode(&pcm, &mut out).expect("encode");
        out.truncate(len);
        out
    }

    fn audio_page(seq: u32, packet: &[u8]) -> Vec<u8> {
        build_page(0x00, u64::from(seq) * 320, seq, &[packet])
    }

    #[test]
    fn partial_page_is_buffered_not_dropped() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        let pages = header_pages();
        let (a, b) = pages.split_at(20);
        assert_eq!(dec.decode(a), DecodeOutcome::NeedMoreData);
        // Completing the header produces no PCM but captures the header.
        assert_eq!(dec.decode(b), DecodeOutcome::NeedMoreData);
        assert!(dec.has_header());
    }

    #[test]
    fn garbage_resets_buffer_but_keeps_header() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        assert_eq!(dec.decode(&header_pages()), DecodeOutcome::NeedMoreData);
        assert!(dec.has_header());
        assert_eq!(dec.decode(b"definitely not an ogg page"), DecodeOutcome::InvalidData);
        assert!(dec.has_header());
    }

    #[test]
    fn non_opus_stream_is_invalid() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        let page = build_page(0x02, 0, 0, &[b"NotOpusHead"]);
        assert_eq!(dec.decode(&page), DecodeOutcome::InvalidData);
        assert!(!dec.has_header());
    }

    #[test]
    fn first_turn_decodes_audio() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        let mut bytes = header_pages();
        bytes.extend_from_slice(&audio_page(2, &encoded_packet()));
        match dec.decode(&bytes) {
            DecodeOutcome::Decoded(frames) => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].sample_rate, 16_000);
                assert_eq!(frames[0].channels, 1);
                assert!(!frames[0].samples.is_empty());
            }
            other => panic!("expected decoded frames, got {other:?}"),
        }
    }

    #[test]
    fn second_turn_decodes_without_header() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        let packet = encoded_packet();

        let mut turn1 = header_pages();
        turn1.extend_from_slice(&audio_page(2, &packet));
        assert!(matches!(dec.decode(&turn1), DecodeOutcome::Decoded(_)));

        // Turn 2: header-less pages, as a live recorder emits them.
        dec.begin_utterance();
        let outcome = dec.decode(&audio_page(3, &packet));
        match outcome {
            DecodeOutcome::Decoded(frames) => {
                assert!(!frames.is_empty());
                assert!(!frames[0].samples.is_empty());
            }
            other => panic!("turn 2 should decode via saved header, got {other:?}"),
        }
    }

    #[test]
    fn begin_utterance_drops_buffered_fragment() {
        let mut dec = ContainerOpusDecoder::new().expect("decoder");
        let mut turn1 = header_pages();
        turn1.extend_from_slice(&audio_page(2, &encoded_packet()));
        assert!(matches!(dec.decode(&turn1), DecodeOutcome::Decoded(_)));

        // Leave a dangling partial page, then start a new turn.
        assert_eq!(dec.decode(&b"OggS\0"[..]), DecodeOutcome::NeedMoreData);
        dec.begin_utterance();
        assert!(matches!(
            dec.decode(&audio_page(3, &encoded_packet())),
            DecodeOutcome::Decoded(_)
        ));
    }

    #[test]
    fn output_format_is_constant() {
        let dec = ContainerOpusDecoder::new().expect("decoder");
        assert_eq!(dec.output_format(), (16_000, 1));
    }
}
