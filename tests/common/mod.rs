//! Shared fixtures for integration tests: a stub STT engine, collecting
//! sinks, and WAV builders.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use voxgate::error::Result;
use voxgate::ingress::{AudioSink, EventSink, SessionEvent};

/// Scripted in-process STT engine speaking the gateway's wire protocol.
pub struct StubStt {
    pub addr: SocketAddr,
}

#[derive(Clone)]
pub struct StubSttScript {
    /// Partial sent after the first audio frame, when set.
    pub partial_text: Option<String>,
    /// Final sent in response to `finalize`.
    pub final_text: String,
}

impl StubStt {
    /// Bind a listener and serve every connection with the same script.
    pub async fn spawn(script: StubSttScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub stt");
        let addr = listener.local_addr().expect("stub stt addr");
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let script = script.clone();
                tokio::spawn(async move {
                    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
                        return;
                    };
                    let (mut write, mut read) = ws.split();
                    let mut sent_partial = false;
                    while let Some(Ok(msg)) = read.next().await {
                        match msg {
                            Message::Text(text) => {
                                let parsed: serde_json::Value =
                                    serde_json::from_str(&text).unwrap_or_default();
                                match parsed.get("type").and_then(|t| t.as_str()) {
                                    Some("start") => {
                                        let _ = write
                                            .send(Message::Text(
                                                json!({"type": "ready"}).to_string(),
                                            ))
                                            .await;
                                    }
                                    Some("finalize") => {
                                        let _ = write
                                            .send(Message::Text(
                                                json!({
                                                    "type": "final",
                                                    "text": script.final_text,
                                                })
                                                .to_string(),
                                            ))
                                            .await;
                                        return;
                                    }
                                    Some("close") => return,
                                    _ => {}
                                }
                            }
                            Message::Binary(_) => {
                                if !sent_partial
                                    && let Some(partial) = &script.partial_text
                                {
                                    sent_partial = true;
                                    let _ = write
                                        .send(Message::Text(
                                            json!({"type": "partial", "text": partial})
                                                .to_string(),
                                        ))
                                        .await;
                                }
                            }
                            Message::Close(_) => return,
                            _ => {}
                        }
                    }
                });
            }
        });
        Self { addr }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/stt", self.addr)
    }
}

/// Sink that records everything for assertions.
#[derive(Default)]
pub struct CollectSink {
    pub audio: Mutex<Vec<Bytes>>,
    pub events: Mutex<Vec<SessionEvent>>,
}

impl CollectSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn audio_bytes(&self) -> Vec<u8> {
        self.audio
            .lock()
            .expect("audio lock")
            .iter()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn count_events(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }
}

#[async_trait]
impl AudioSink for CollectSink {
    async fn play(&self, audio: Bytes) -> Result<()> {
        self.audio.lock().expect("audio lock").push(audio);
        Ok(())
    }
}

#[async_trait]
impl EventSink for CollectSink {
    async fn emit(&self, event: SessionEvent) -> Result<()> {
        self.events.lock().expect("events lock").push(event);
        Ok(())
    }
}

/// A minimal valid 16-bit mono WAV whose data bytes are all `marker`,
/// so playback order is visible in the collected byte stream.
pub fn marked_wav(marker: u8, data_len: u32) -> Vec<u8> {
    let sample_rate = 24_000u32;
    let byte_rate = sample_rate * 2;
    let mut wav = Vec::new();
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes());
    wav.extend_from_slice(&16u16.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(&vec![marker; data_len as usize]);
    wav
}

/// First positions of each marker byte in a collected audio stream.
/// Markers that never occur map to `None`.
pub fn marker_positions(audio: &[u8], markers: &[u8]) -> Vec<Option<usize>> {
    markers
        .iter()
        .map(|m| audio.iter().position(|b| b == m))
        .collect()
}

/// Ogg page CRC: polynomial 0x04C11DB7, no reflection, zero init.
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

/// Build one Ogg page holding the given packets.
pub fn ogg_page(header_type: u8, granule: u64, seq: u32, packets: &[&[u8]]) -> Vec<u8> {
    let mut lacing = Vec::new();
    let mut payload = Vec::new();
    for p in packets {
        assert!(p.len() < 255, "test packets must fit one segment");
        lacing.push(p.len() as u8);
        payload.extend_from_slice(p);
    }
    let mut page = Vec::new();
    page.extend_from_slice(b"OggS");
    page.push(0);
    page.push(header_type);
    page.extend_from_slice(&granule.to_le_bytes());
    page.extend_from_slice(&0x7A31u32.to_le_bytes());
    page.extend_from_slice(&seq.to_le_bytes());
    page.extend_from_slice(&[0, 0, 0, 0]);
    page.push(lacing.len() as u8);
    page.extend_from_slice(&lacing);
    page.extend_from_slice(&payload);
    let crc = ogg_crc(&page);
    page[22..26].copy_from_slice(&crc.to_le_bytes());
    page
}

/// Identification + comment header pages of an Ogg-Opus stream, as a
/// browser recorder emits them at recording start.
pub fn ogg_opus_header() -> Vec<u8> {
    let mut head = Vec::new();
    head.extend_from_slice(b"OpusHead");
    head.push(1);
    head.push(1);
    head.extend_from_slice(&312u16.to_le_bytes());
    head.extend_from_slice(&16_000u32.to_le_bytes());
    head.extend_from_slice(&0u16.to_le_bytes());
    head.push(0);

    let mut tags = Vec::new();
    tags.extend_from_slice(b"OpusTags");
    tags.extend_from_slice(&7u32.to_le_bytes());
    tags.extend_from_slice(b"voxgate");
    tags.extend_from_slice(&0u32.to_le_bytes());

    let mut bytes = ogg_page(0x02, 0, 0, &[&head]);
    bytes.extend_from_slice(&ogg_page(0x00, 0, 1, &[&tags]));
    bytes
}

/// One real Opus packet: 20 ms of a quiet tone at 16 kHz mono.
pub fn opus_packet() -> Vec<u8> {
    use audiopus::coder::Encoder;
    use audiopus::{Application, Channels, SampleRate};

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

/// An audio page wrapping one Opus packet.
pub fn ogg_audio_page(seq: u32, packet: &[u8]) -> Vec<u8> {
    ogg_page(0x00, u64::from(seq) * 320, seq, &[packet])
}

/// SSE body streaming `text` split into `n` delta chunks, `[DONE]`
/// terminated, in the OpenAI-compatible wire format.
pub fn sse_body(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let per = chars.len().div_ceil(n.max(1));
    let mut body = String::new();
    for piece in chars.chunks(per) {
        let fragment: String = piece.iter().collect();
        let event = json!({"choices": [{"delta": {"content": fragment}}]});
        body.push_str(&format!("data: {event}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}
