//! Owns the set of live sessions and routes ingress events to them.
//!
//! The session map is the only process-wide mutable structure; it sits
//! behind one writer lock and holds per-session handles (event sender +
//! cancellation token). Everything else lives inside the session task.
//! A panic in one session's task is caught at the join boundary, logged,
//! and cleaned up; other sessions never notice.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::error::{GatewayError, Result};
use crate::ingress::{AudioSink, EventSink, IngressEvent, SessionEvent};
use crate::llm;
use crate::metrics::Metrics;
use crate::store::ConversationStore;
use crate::store::types::IngressKind;
use crate::stt::SttClient;
use crate::tts::TtsClient;

use super::{SessionContext, UtteranceMachine};

/// Per-session event queue depth. Audio frames flow through this; the
/// bound is the ingest backpressure point.
const SESSION_EVENT_QUEUE: usize = 256;

struct SessionHandle {
    events_tx: mpsc::Sender<IngressEvent>,
    cancel: CancellationToken,
    /// Attach generation: a re-attach replaces the handle, and the old
    /// watcher must not clean up the new one.
    epoch: u64,
}

/// What an adapter needs to attach a transport to the core.
pub struct AttachParams {
    /// Opaque user id from the transport.
    pub user_id: String,
    pub ingress: IngressKind,
    /// Resume this session when it exists and is active.
    pub session_id: Option<Uuid>,
    /// Agent to attach to when creating a session. Empty selects the
    /// configured default for the ingress.
    pub agent_name: Option<String>,
    pub sink: Arc<dyn AudioSink>,
    pub events: Arc<dyn EventSink>,
}

pub struct SessionSupervisor {
    config: ConfigHandle,
    store: ConversationStore,
    tts: TtsClient,
    metrics: Arc<Metrics>,
    /// The one process-wide mutable structure. Shared with the watcher
    /// tasks so cleanup does not need a handle to the supervisor itself.
    sessions: Arc<RwLock<HashMap<Uuid, SessionHandle>>>,
    attach_epoch: std::sync::atomic::AtomicU64,
}

impl SessionSupervisor {
    pub fn new(
        config: ConfigHandle,
        store: ConversationStore,
        tts: TtsClient,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            store,
            tts,
            metrics,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            attach_epoch: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    pub fn tts(&self) -> &TtsClient {
        &self.tts
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    /// Number of live sessions.
    pub fn active_sessions(&self) -> usize {
        self.sessions.read().expect("session map poisoned").len()
    }

    /// Create or resume the session for this transport and spawn its
    /// state machine. Returns the session id the adapter should dispatch
    /// against.
    pub async fn attach(&self, params: AttachParams) -> Result<Uuid> {
        let config = self.config.get();

        // Resolve the agent: an explicit session wins, then the named
        // agent, then the ingress default.
        let session = if let Some(id) = params.session_id
            && let Some(existing) = self.store.session(id).await?
            && existing.active
        {
            existing
        } else {
            let agent_name = params
                .agent_name
                .clone()
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| config.ingress.chat_agent.clone());
            let agent = if agent_name.is_empty() {
                self.store
                    .list_agents()
                    .await?
                    .into_iter()
                    .find(|a| a.active)
                    .ok_or_else(|| GatewayError::Session("no active agent configured".into()))?
            } else {
                self.store
                    .agent_by_name(&agent_name)
                    .await?
                    .ok_or_else(|| GatewayError::Session(format!("unknown agent: {agent_name}")))?
            };
            self.store
                .get_or_create_session(&params.user_id, agent.id, params.ingress)
                .await?
        };

        // An adapter re-attaching to a live session replaces the old
        // transport. The stale handle leaves the map here so its watcher
        // cannot end the session the new attachment is resuming.
        {
            let old = self
                .sessions
                .write()
                .expect("session map poisoned")
                .remove(&session.id);
            if let Some(old) = old {
                old.cancel.cancel();
            }
        }

        let agent = self.store.get_agent_config(session.id).await?;
        let provider = llm::provider_for(agent.provider, &config.llm, Arc::clone(&self.metrics));
        let stt = SttClient::new(config.stt.clone(), config.turn.language.clone());

        let ctx = SessionContext {
            session: session.clone(),
            agent,
            config: self.config.clone(),
            store: self.store.clone(),
            stt,
            tts: self.tts.clone(),
            provider,
            sink: params.sink,
            events: Arc::clone(&params.events),
            metrics: Arc::clone(&self.metrics),
        };

        let machine = UtteranceMachine::new(ctx)?;
        let (events_tx, events_rx) = mpsc::channel::<IngressEvent>(SESSION_EVENT_QUEUE);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(machine.run(events_rx, cancel.clone()));

        let epoch = self
            .attach_epoch
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        {
            let mut sessions = self.sessions.write().expect("session map poisoned");
            sessions.insert(
                session.id,
                SessionHandle {
                    events_tx,
                    cancel: cancel.clone(),
                    epoch,
                },
            );
        }
        self.metrics.session_started();
        info!(session = %session.id, user = %session.user_id, ingress = ?session.ingress, "session attached");

        // Watcher: contain panics, then clean up map and store.
        let sessions_map = Arc::clone(&self.sessions);
        let store = self.store.clone();
        let event_sink = params.events;
        let session_id = session.id;
        tokio::spawn(async move {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    error!(session = %session_id, "session task panicked: {e}");
                    let _ = event_sink
                        .emit(SessionEvent::ServiceError {
                            message: "internal session failure".into(),
                        })
                        .await;
                }
                Err(e) => warn!(session = %session_id, "session task aborted: {e}"),
            }
            // Only the watcher of the current attachment cleans up; a
            // replaced transport's watcher leaves the new one alone.
            let removed = {
                let mut sessions = sessions_map.write().expect("session map poisoned");
                match sessions.get(&session_id) {
                    Some(handle) if handle.epoch == epoch => {
                        sessions.remove(&session_id);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                if let Err(e) = store.end_session(session_id).await {
                    warn!(session = %session_id, error = %e, "failed to end session");
                }
                info!(session = %session_id, "session detached");
            }
        });

        Ok(session.id)
    }

    /// Deliver one ingress event to a session, preserving arrival order.
    /// The bounded queue backpressures a transport that outruns the
    /// session task.
    pub async fn dispatch(&self, session_id: Uuid, event: IngressEvent) -> Result<()> {
        let tx = {
            let sessions = self.sessions.read().expect("session map poisoned");
            sessions
                .get(&session_id)
                .map(|handle| handle.events_tx.clone())
        };
        match tx {
            Some(tx) => tx
                .send(event)
                .await
                .map_err(|_| GatewayError::Session(format!("session {session_id} is gone"))),
            None => Err(GatewayError::Session(format!(
                "unknown session: {session_id}"
            ))),
        }
    }

    /// Cancel a session's subtree. The watcher finishes cleanup; in-flight
    /// I/O observes the token promptly.
    pub async fn detach(&self, session_id: Uuid) {
        let cancel = {
            let sessions = self.sessions.read().expect("session map poisoned");
            sessions.get(&session_id).map(|h| h.cancel.clone())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
    }

    /// Cancel every live session (process shutdown).
    pub fn shutdown(&self) {
        let sessions = self.sessions.read().expect("session map poisoned");
        for handle in sessions.values() {
            handle.cancel.cancel();
        }
    }

}

impl std::fmt::Debug for SessionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSupervisor")
            .field("active_sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}
