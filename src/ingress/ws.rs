//! Browser WebSocket ingress.
//!
//! One socket per microphone session: inbound binary frames are
//! streaming-Opus container chunks, inbound text frames are control
//! messages, outbound text frames are the JSON session events, and
//! outbound binary frames are synthesized audio. The connection is the
//! session, not the utterance; it persists across turns and closes only
//! on client disconnect or idle timeout.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::health::HealthReport;
use crate::session::SessionSupervisor;
use crate::store::types::IngressKind;

use super::{AudioSink, EventSink, IngressEvent, SessionEvent};

/// Outbound socket queue depth; audio chunks dominate.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, Deserialize)]
struct VoiceQuery {
    #[serde(default)]
    session_id: Option<Uuid>,
    user_id: String,
    #[serde(default)]
    agent: Option<String>,
}

/// Inbound text control messages.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ControlMessage {
    /// Declares the stream's audio format and acts as speaker start.
    SessionInit {
        #[serde(default)]
        audio_format: Option<String>,
    },
    /// The user released the microphone; finalize early.
    StopMic,
}

enum Outbound {
    Event(SessionEvent),
    Audio(Bytes),
}

/// Both sink halves write into the socket writer's queue.
#[derive(Clone)]
struct SocketSink {
    tx: mpsc::Sender<Outbound>,
}

#[async_trait]
impl AudioSink for SocketSink {
    async fn play(&self, audio: Bytes) -> Result<()> {
        self.tx
            .send(Outbound::Audio(audio))
            .await
            .map_err(|_| GatewayError::Session("websocket writer closed".into()))
    }
}

#[async_trait]
impl EventSink for SocketSink {
    async fn emit(&self, event: SessionEvent) -> Result<()> {
        self.tx
            .send(Outbound::Event(event))
            .await
            .map_err(|_| GatewayError::Session("websocket writer closed".into()))
    }
}

/// Routes exposed by the gateway: the voice WebSocket and health.
pub fn router(supervisor: Arc<SessionSupervisor>) -> Router {
    Router::new()
        .route("/ws/voice", get(ws_voice))
        .route("/health", get(health))
        .with_state(supervisor)
}

async fn health(State(supervisor): State<Arc<SessionSupervisor>>) -> impl IntoResponse {
    let tts = supervisor.tts().health().await;
    // STT/LLM probes are per-agent; the gateway reports what it can see
    // without holding a session open.
    let report = HealthReport::aggregate(
        crate::health::ServiceHealth::Ok,
        tts,
        crate::health::ServiceHealth::Ok,
        supervisor.metrics().snapshot(),
    );
    axum::Json(serde_json::json!({
        "status": report.status,
        "tts": report.tts,
        "active_sessions": supervisor.active_sessions(),
        "metrics": report.metrics,
    }))
}

async fn ws_voice(
    ws: WebSocketUpgrade,
    Query(query): Query<VoiceQuery>,
    State(supervisor): State<Arc<SessionSupervisor>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, supervisor, query))
}

async fn handle_socket(socket: WebSocket, supervisor: Arc<SessionSupervisor>, query: VoiceQuery) {
    let (mut write, mut read) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(OUTBOUND_QUEUE);
    let sink = Arc::new(SocketSink { tx: out_tx });

    let session_id = match supervisor
        .attach(crate::session::supervisor::AttachParams {
            user_id: query.user_id.clone(),
            ingress: IngressKind::Browser,
            session_id: query.session_id,
            agent_name: query.agent,
            sink: Arc::clone(&sink) as Arc<dyn AudioSink>,
            events: Arc::clone(&sink) as Arc<dyn EventSink>,
        })
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!(user = %query.user_id, error = %e, "websocket attach failed");
            let event = SessionEvent::ServiceError {
                message: "could not start session".into(),
            };
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = write.send(Message::Text(json.into())).await;
            }
            let _ = write.close().await;
            return;
        }
    };
    info!(session = %session_id, user = %query.user_id, "browser session connected");

    // Writer: session events as JSON text, synthesized audio as binary.
    let writer = tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let msg = match out {
                Outbound::Event(event) => match serde_json::to_string(&event) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!("failed to encode session event: {e}");
                        continue;
                    }
                },
                Outbound::Audio(audio) => Message::Binary(audio),
            };
            if write.send(msg).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    // Reader: transport frames become uniform ingress events.
    while let Some(msg) = read.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(session = %session_id, "websocket read error: {e}");
                break;
            }
        };
        match msg {
            Message::Binary(frame) => {
                let event = IngressEvent::Audio {
                    user_id: query.user_id.clone(),
                    frame,
                };
                if supervisor.dispatch(session_id, event).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => match serde_json::from_str::<ControlMessage>(text.as_str()) {
                Ok(ControlMessage::SessionInit { audio_format }) => {
                    if let Some(format) = audio_format
                        && format != "opus"
                    {
                        debug!(session = %session_id, format = %format, "browser declared non-opus input");
                    }
                    let event = IngressEvent::SpeakerStart {
                        user_id: query.user_id.clone(),
                    };
                    if supervisor.dispatch(session_id, event).await.is_err() {
                        break;
                    }
                }
                Ok(ControlMessage::StopMic) => {
                    let event = IngressEvent::SpeakerEnd {
                        user_id: query.user_id.clone(),
                    };
                    if supervisor.dispatch(session_id, event).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(session = %session_id, "ignoring malformed control message: {e}");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Disconnect finalizes in-flight work and releases resources.
    let _ = supervisor.dispatch(session_id, IngressEvent::Disconnect).await;
    supervisor.detach(session_id).await;
    writer.abort();
    info!(session = %session_id, "browser session disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_messages_parse() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"type":"session_init","audio_format":"opus"}"#)
                .expect("parse");
        assert!(matches!(
            msg,
            ControlMessage::SessionInit { audio_format: Some(f) } if f == "opus"
        ));

        let msg: ControlMessage = serde_json::from_str(r#"{"type":"stop_mic"}"#).expect("parse");
        assert!(matches!(msg, ControlMessage::StopMic));
    }

    #[test]
    fn unknown_control_is_rejected() {
        assert!(serde_json::from_str::<ControlMessage>(r#"{"type":"reboot"}"#).is_err());
    }
}
