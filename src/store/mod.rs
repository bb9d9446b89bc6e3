//! Conversation store: agents, sessions, messages, and the context cache.
//!
//! Persistence is at-least-once: `append_message` resolves only after the
//! insert is durable, and every committed append is visible to the next
//! `get_context` (the affected cache entry is invalidated inside the
//! append call).

mod cache;
pub mod schema;
mod sqlite;
pub mod types;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{GatewayError, Result};

use cache::ContextCache;
pub use sqlite::SqliteStore;
use types::{Agent, IngressKind, Message, Role, Session, TurnLatency};

/// Async facade over the SQLite store plus the per-session context cache.
///
/// SQLite calls run on the blocking pool; the cache is checked inline.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<SqliteStore>,
    cache: Arc<ContextCache>,
    max_context_messages: usize,
}

impl std::fmt::Debug for ConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationStore")
            .field("max_context_messages", &self.max_context_messages)
            .finish_non_exhaustive()
    }
}

impl ConversationStore {
    /// Open the configured database file.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let path = config.resolved_db_path();
        let inner = tokio::task::spawn_blocking(move || SqliteStore::open(&path))
            .await
            .map_err(|e| GatewayError::Store(format!("open task: {e}")))??;
        Ok(Self {
            inner: Arc::new(inner),
            cache: Arc::new(ContextCache::new(config.context_cache_ttl())),
            max_context_messages: config.max_context_messages,
        })
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(SqliteStore::open_in_memory()?),
            cache: Arc::new(ContextCache::new(config.context_cache_ttl())),
            max_context_messages: config.max_context_messages,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| GatewayError::Store(format!("store task: {e}")))?
    }

    // ── agents ────────────────────────────────────────────────

    pub async fn create_agent(&self, agent: Agent) -> Result<Agent> {
        self.blocking(move |s| {
            s.insert_agent(&agent)?;
            Ok(agent)
        })
        .await
    }

    pub async fn update_agent(&self, agent: Agent) -> Result<()> {
        self.blocking(move |s| s.update_agent(&agent)).await
    }

    pub async fn agent(&self, id: Uuid) -> Result<Option<Agent>> {
        self.blocking(move |s| s.get_agent(id)).await
    }

    pub async fn agent_by_name(&self, name: &str) -> Result<Option<Agent>> {
        let name = name.to_owned();
        self.blocking(move |s| s.get_agent_by_name(&name)).await
    }

    pub async fn list_agents(&self) -> Result<Vec<Agent>> {
        self.blocking(|s| s.list_agents()).await
    }

    /// Delete an agent; its sessions and their messages cascade.
    pub async fn delete_agent(&self, id: Uuid) -> Result<()> {
        self.blocking(move |s| s.delete_agent(id)).await
    }

    // ── sessions ──────────────────────────────────────────────

    /// Atomic: concurrent calls for the same `(user_id, ingress)` return
    /// the same session.
    pub async fn get_or_create_session(
        &self,
        user_id: &str,
        agent_id: Uuid,
        ingress: IngressKind,
    ) -> Result<Session> {
        let user_id = user_id.to_owned();
        self.blocking(move |s| s.get_or_create_session(&user_id, agent_id, ingress))
            .await
    }

    pub async fn session(&self, id: Uuid) -> Result<Option<Session>> {
        self.blocking(move |s| s.get_session(id)).await
    }

    /// Mark the session inactive and drop its cached context.
    pub async fn end_session(&self, id: Uuid) -> Result<()> {
        self.cache.invalidate(id);
        self.blocking(move |s| s.end_session(id)).await
    }

    /// Agent configuration a session runs with.
    pub async fn get_agent_config(&self, session_id: Uuid) -> Result<Agent> {
        self.blocking(move |s| s.get_agent_for_session(session_id))
            .await
    }

    // ── messages & context ────────────────────────────────────

    /// Recent message tail for prompt building, read through the cache.
    pub async fn get_context(&self, session_id: Uuid) -> Result<Vec<Message>> {
        if let Some(cached) = self.cache.get(session_id) {
            return Ok(cached);
        }
        let limit = self.max_context_messages;
        let messages = self
            .blocking(move |s| s.recent_messages(session_id, limit))
            .await?;
        self.cache.put(session_id, messages.clone());
        Ok(messages)
    }

    /// Append one message. Resolves after durable commit; the context
    /// cache entry is invalidated so the next read reflects the append.
    pub async fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: &str,
        latency: Option<TurnLatency>,
    ) -> Result<Message> {
        let content = content.to_owned();
        let message = self
            .blocking(move |s| s.append_message(session_id, role, &content, latency))
            .await?;
        self.cache.invalidate(session_id);
        Ok(message)
    }
}
