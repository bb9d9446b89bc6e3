//! Chat-platform voice ingress.
//!
//! The platform SDK and its voice transport stay outside this crate; a
//! [`VoiceTransport`] implementation bridges them. The adapter subscribes
//! to speaker start/stop events and per-speaker framed-Opus streams, maps
//! them onto the uniform core events, and plays synthesized audio back
//! through the transport's send path. Session events have no wire
//! representation on this ingress and are dropped.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::session::SessionSupervisor;
use crate::session::supervisor::AttachParams;
use crate::store::types::IngressKind;

use super::{AudioSink, EventSink, IngressEvent, NullEventSink};

/// Transport-level events the platform SDK surfaces.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    SpeakerStart { user_id: String },
    SpeakerStop { user_id: String },
    /// One decodable Opus frame for a speaker.
    AudioFrame { user_id: String, frame: Bytes },
    /// The voice connection ended.
    Closed,
}

/// Seam to the external chat platform. Implementations own the SDK
/// connection; `run` feeds transport events until the connection ends,
/// `play` hands synthesized audio to the platform's audio send. The byte
/// format of `play` is whatever the transport's encoder expects.
#[async_trait]
pub trait VoiceTransport: Send + Sync {
    /// Stable transport identifier for logs.
    fn id(&self) -> &'static str;

    /// Pump transport events into `events_tx` until the connection ends.
    async fn run(&self, events_tx: mpsc::Sender<VoiceEvent>) -> Result<()>;

    /// Send synthesized audio to the channel.
    async fn play(&self, audio: Bytes) -> Result<()>;
}

/// Audio sink backed by the transport's send path.
struct TransportSink {
    transport: Arc<dyn VoiceTransport>,
}

#[async_trait]
impl AudioSink for TransportSink {
    async fn play(&self, audio: Bytes) -> Result<()> {
        self.transport.play(audio).await
    }
}

/// Bridge one voice transport to the session supervisor. Returns when
/// the transport closes; per-speaker sessions are detached on the way
/// out.
pub async fn run_chat_adapter(
    transport: Arc<dyn VoiceTransport>,
    supervisor: Arc<SessionSupervisor>,
) -> Result<()> {
    let (events_tx, mut events_rx) = mpsc::channel::<VoiceEvent>(256);

    let pump = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move {
            if let Err(e) = transport.run(events_tx).await {
                warn!(transport = transport.id(), error = %e, "voice transport ended with error");
            }
        })
    };

    // Transport user → live session. Routing only; the store enforces
    // the one-active-session-per-user invariant.
    let mut sessions: HashMap<String, Uuid> = HashMap::new();

    while let Some(event) = events_rx.recv().await {
        match event {
            VoiceEvent::SpeakerStart { user_id } => {
                let session_id = match sessions.get(&user_id) {
                    Some(id) => *id,
                    None => {
                        let sink = Arc::new(TransportSink {
                            transport: Arc::clone(&transport),
                        });
                        match supervisor
                            .attach(AttachParams {
                                user_id: user_id.clone(),
                                ingress: IngressKind::Chat,
                                session_id: None,
                                agent_name: None,
                                sink: sink as Arc<dyn AudioSink>,
                                events: Arc::new(NullEventSink) as Arc<dyn EventSink>,
                            })
                            .await
                        {
                            Ok(id) => {
                                sessions.insert(user_id.clone(), id);
                                id
                            }
                            Err(e) => {
                                warn!(user = %user_id, error = %e, "chat attach failed");
                                continue;
                            }
                        }
                    }
                };
                let _ = supervisor
                    .dispatch(session_id, IngressEvent::SpeakerStart { user_id })
                    .await;
            }
            VoiceEvent::AudioFrame { user_id, frame } => {
                if let Some(session_id) = sessions.get(&user_id) {
                    let _ = supervisor
                        .dispatch(*session_id, IngressEvent::Audio { user_id, frame })
                        .await;
                } else {
                    // Audio for a speaker who never started: platform
                    // event ordering glitch, drop it.
                    debug!(user = %user_id, "dropping frame without speaker start");
                }
            }
            VoiceEvent::SpeakerStop { user_id } => {
                if let Some(session_id) = sessions.get(&user_id) {
                    let _ = supervisor
                        .dispatch(*session_id, IngressEvent::SpeakerEnd { user_id })
                        .await;
                }
            }
            VoiceEvent::Closed => break,
        }
    }

    info!(transport = transport.id(), "voice transport closed, detaching sessions");
    for (user_id, session_id) in sessions {
        let _ = supervisor
            .dispatch(session_id, IngressEvent::Disconnect)
            .await;
        supervisor.detach(session_id).await;
        debug!(user = %user_id, session = %session_id, "chat session detached");
    }
    pump.abort();
    Ok(())
}
