//! Per-session turn management and process-wide session supervision.

pub mod supervisor;
pub mod utterance;

use std::sync::Arc;

use crate::config::ConfigHandle;
use crate::ingress::{AudioSink, EventSink};
use crate::llm::LlmProvider;
use crate::metrics::Metrics;
use crate::store::ConversationStore;
use crate::store::types::{Agent, Session};
use crate::stt::SttClient;
use crate::tts::TtsClient;

pub use supervisor::SessionSupervisor;
pub use utterance::UtteranceMachine;

/// Everything one session's state machine needs. Built by the supervisor
/// at attach time; owned by the session task.
pub struct SessionContext {
    pub session: Session,
    pub agent: Agent,
    pub config: ConfigHandle,
    pub store: ConversationStore,
    pub stt: SttClient,
    pub tts: TtsClient,
    pub provider: Arc<dyn LlmProvider>,
    pub sink: Arc<dyn AudioSink>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session", &self.session.id)
            .field("agent", &self.agent.name)
            .finish_non_exhaustive()
    }
}
