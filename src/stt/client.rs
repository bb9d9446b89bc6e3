//! STT WebSocket stream implementation.

use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::SttConfig;
use crate::error::{GatewayError, Result};

use super::{AudioFormat, ServerMessage, SttEvent};

/// Buffer for inbound engine events; partials are small and frequent.
const EVENT_CHANNEL_SIZE: usize = 32;

/// Factory for STT streams. Cheap to clone; holds no connection.
#[derive(Debug, Clone)]
pub struct SttClient {
    config: SttConfig,
    language: String,
}

impl SttClient {
    pub fn new(config: SttConfig, language: impl Into<String>) -> Self {
        Self {
            config,
            language: language.into(),
        }
    }

    /// Open a stream for one utterance. Resolves once the engine has
    /// acknowledged the `start` message with `ready`.
    pub async fn open(&self, user_id: &str, format: AudioFormat) -> Result<SttStream> {
        let conn = connect(&self.config, &self.language, user_id, format).await?;
        Ok(SttStream {
            config: self.config.clone(),
            language: self.language.clone(),
            user_id: user_id.to_owned(),
            format,
            conn,
            replay: Vec::new(),
            finalized: false,
        })
    }
}

/// One live bidirectional stream to the engine.
///
/// Frames sent through [`send_audio`](Self::send_audio) are delivered in
/// arrival order; the bounded outbound queue exerts backpressure when the
/// engine falls behind. A replay buffer of all frames sent for the current
/// utterance supports the caller's reconnect decision; it is dropped at
/// finalize.
pub struct SttStream {
    config: SttConfig,
    language: String,
    user_id: String,
    format: AudioFormat,
    conn: Conn,
    replay: Vec<Bytes>,
    finalized: bool,
}

struct Conn {
    out_tx: mpsc::Sender<OutMsg>,
    events_rx: mpsc::Receiver<SttEvent>,
}

enum OutMsg {
    Audio(Bytes),
    Control(String),
}

impl SttStream {
    /// Queue one audio frame, in order. Blocks when the engine is slow.
    pub async fn send_audio(&mut self, frame: Bytes) -> Result<()> {
        self.replay.push(frame.clone());
        self.conn
            .out_tx
            .send(OutMsg::Audio(frame))
            .await
            .map_err(|_| GatewayError::Stt("stream writer closed".into()))
    }

    /// Next engine event. Returns `Disconnected` when the transport is gone.
    pub async fn next_event(&mut self) -> SttEvent {
        self.conn
            .events_rx
            .recv()
            .await
            .unwrap_or_else(|| SttEvent::Disconnected("event channel closed".into()))
    }

    /// Signal end-of-utterance. Idempotent; the engine replies with its
    /// terminal final.
    pub async fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.replay.clear();
        self.conn
            .out_tx
            .send(OutMsg::Control(json!({"type": "finalize"}).to_string()))
            .await
            .map_err(|_| GatewayError::Stt("stream writer closed".into()))
    }

    /// Whether `finalize` has already been requested.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Number of frames held for replay on reconnect.
    pub fn replay_len(&self) -> usize {
        self.replay.len()
    }

    /// Re-establish the transport after a drop, with exponential backoff.
    ///
    /// When `replay_audio` is set, every frame sent for the current
    /// utterance is re-streamed on the fresh connection (the engine sees
    /// the utterance from its start). The caller chooses: re-stream for a
    /// long utterance, skip for one already near silence.
    pub async fn reconnect(&mut self, replay_audio: bool) -> Result<()> {
        let mut delay = Duration::from_millis(self.config.reconnect_base_ms);
        let cap = Duration::from_millis(self.config.reconnect_cap_ms);
        let mut last_err = String::new();

        for attempt in 1..=self.config.max_reconnect_attempts {
            match connect(&self.config, &self.language, &self.user_id, self.format).await {
                Ok(conn) => {
                    self.conn = conn;
                    if replay_audio {
                        for frame in self.replay.clone() {
                            self.conn
                                .out_tx
                                .send(OutMsg::Audio(frame))
                                .await
                                .map_err(|_| {
                                    GatewayError::Stt("stream writer closed during replay".into())
                                })?;
                        }
                    }
                    debug!(attempt, replay_audio, "STT stream reconnected");
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    warn!(attempt, error = %last_err, "STT reconnect attempt failed");
                    // Spread concurrent reconnects a little.
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(cap);
                }
            }
        }
        Err(GatewayError::SttConnect(format!(
            "reconnect attempts exhausted: {last_err}"
        )))
    }

    /// Terminal cleanup. Dropping the stream also closes the transport.
    pub async fn close(mut self) {
        let _ = self
            .conn
            .out_tx
            .send(OutMsg::Control(json!({"type": "close"}).to_string()))
            .await;
    }
}

/// Dial the engine, perform the start/ready handshake, and spawn the
/// writer and reader tasks.
async fn connect(
    config: &SttConfig,
    language: &str,
    user_id: &str,
    format: AudioFormat,
) -> Result<Conn> {
    let connect_deadline = Duration::from_millis(config.connect_timeout_ms);
    let (ws, _) = timeout(connect_deadline, tokio_tungstenite::connect_async(&config.url))
        .await
        .map_err(|_| GatewayError::SttConnect(format!("connect timed out ({})", config.url)))?
        .map_err(|e| GatewayError::SttConnect(e.to_string()))?;

    let (mut write, mut read) = ws.split();

    // The format indicator is authoritative for the stream: the engine
    // routes frames to a decoder based on it and it never changes.
    let start = json!({
        "type": "start",
        "userId": user_id,
        "audio_format": format.wire_name(),
        "language": language,
    });
    write
        .send(Message::Text(start.to_string()))
        .await
        .map_err(|e| GatewayError::SttConnect(format!("start message: {e}")))?;

    // Audio may only flow after the engine acknowledges.
    let ready = timeout(connect_deadline, async {
        while let Some(msg) = read.next().await {
            let msg = msg.map_err(|e| GatewayError::SttConnect(e.to_string()))?;
            if let Message::Text(text) = msg {
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::Ready) => return Ok(()),
                    Ok(ServerMessage::Error { error }) => {
                        return Err(GatewayError::SttConnect(error));
                    }
                    Ok(other) => {
                        debug!(?other, "unexpected message before ready");
                    }
                    Err(e) => {
                        return Err(GatewayError::Protocol(format!("pre-ready message: {e}")));
                    }
                }
            }
        }
        Err(GatewayError::SttConnect("closed before ready".into()))
    })
    .await
    .map_err(|_| GatewayError::SttConnect("no ready within deadline".into()))?;
    ready?;

    let (out_tx, mut out_rx) = mpsc::channel::<OutMsg>(config.send_queue_frames);
    let (events_tx, events_rx) = mpsc::channel::<SttEvent>(EVENT_CHANNEL_SIZE);

    // Writer: drains the bounded queue in order. Never reorders.
    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let msg = match out {
                OutMsg::Audio(frame) => Message::Binary(frame.to_vec()),
                OutMsg::Control(text) => Message::Text(text),
            };
            if let Err(e) = write.send(msg).await {
                debug!("STT writer ended: {e}");
                break;
            }
        }
        let _ = write.close().await;
    });

    // Reader: forwards engine events. One final is terminal.
    tokio::spawn(async move {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    let event = match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::Ready) => continue,
                        Ok(ServerMessage::Partial { text }) => SttEvent::Partial(text),
                        Ok(ServerMessage::Final { text }) => SttEvent::Final(text),
                        Ok(ServerMessage::Error { error }) => SttEvent::EngineError(error),
                        Err(e) => SttEvent::EngineError(format!("malformed engine message: {e}")),
                    };
                    let terminal = matches!(event, SttEvent::Final(_));
                    if events_tx.send(event).await.is_err() || terminal {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events_tx
                        .send(SttEvent::Disconnected("engine closed stream".into()))
                        .await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = events_tx.send(SttEvent::Disconnected(e.to_string())).await;
                    break;
                }
            }
        }
    });

    Ok(Conn { out_tx, events_rx })
}
