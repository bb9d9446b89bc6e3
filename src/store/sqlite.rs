//! SQLite-backed conversation store.
//!
//! Thread-safe via an internal `Mutex<Connection>`. All writes are
//! serialized; WAL mode keeps readers cheap. The async facade in
//! [`super::ConversationStore`] moves calls onto the blocking pool.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::error::{GatewayError, Result};

use super::schema::apply_schema;
use super::types::{Agent, IngressKind, Message, ProviderKind, Role, Session, TtsParams, TurnLatency};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn db_err(e: rusqlite::Error) -> GatewayError {
    GatewayError::Store(e.to_string())
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Store(format!("bad timestamp '{raw}': {e}")))
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Store(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        apply_schema(&conn).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        if let Err(e) = store.integrity_check() {
            tracing::warn!(error = %e, "SQLite integrity check failed on open");
        }
        Ok(store)
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        apply_schema(&conn).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn integrity_check(&self) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let ok: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(db_err)?;
        if ok == "ok" {
            Ok(())
        } else {
            Err(GatewayError::Store(format!("integrity: {ok}")))
        }
    }

    // ── agents ────────────────────────────────────────────────

    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        agent.validate()?;
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "INSERT INTO agents (id, name, system_prompt, provider, model, temperature,
                 tts_voice, tts_exaggeration, tts_cfg_weight, tts_temperature, tts_language,
                 created_at, updated_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                agent.id.to_string(),
                agent.name,
                agent.system_prompt,
                agent.provider.as_str(),
                agent.model,
                agent.temperature,
                agent.tts_voice,
                agent.tts_params.exaggeration,
                agent.tts_params.cfg_weight,
                agent.tts_params.temperature,
                agent.tts_params.language,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
                agent.active,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn update_agent(&self, agent: &Agent) -> Result<()> {
        agent.validate()?;
        let conn = self.conn.lock().expect("store lock poisoned");
        let changed = conn
            .execute(
                "UPDATE agents SET name = ?2, system_prompt = ?3, provider = ?4, model = ?5,
                     temperature = ?6, tts_voice = ?7, tts_exaggeration = ?8,
                     tts_cfg_weight = ?9, tts_temperature = ?10, tts_language = ?11,
                     updated_at = ?12, active = ?13
                 WHERE id = ?1",
                params![
                    agent.id.to_string(),
                    agent.name,
                    agent.system_prompt,
                    agent.provider.as_str(),
                    agent.model,
                    agent.temperature,
                    agent.tts_voice,
                    agent.tts_params.exaggeration,
                    agent.tts_params.cfg_weight,
                    agent.tts_params.temperature,
                    agent.tts_params.language,
                    Utc::now().to_rfc3339(),
                    agent.active,
                ],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(GatewayError::Store(format!("no such agent: {}", agent.id)));
        }
        Ok(())
    }

    pub fn get_agent(&self, id: Uuid) -> Result<Option<Agent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, name, system_prompt, provider, model, temperature, tts_voice,
                    tts_exaggeration, tts_cfg_weight, tts_temperature, tts_language,
                    created_at, updated_at, active
             FROM agents WHERE id = ?1",
            [id.to_string()],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)?
        .transpose()
    }

    pub fn get_agent_by_name(&self, name: &str) -> Result<Option<Agent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, name, system_prompt, provider, model, temperature, tts_voice,
                    tts_exaggeration, tts_cfg_weight, tts_temperature, tts_language,
                    created_at, updated_at, active
             FROM agents WHERE name = ?1",
            [name],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)?
        .transpose()
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, name, system_prompt, provider, model, temperature, tts_voice,
                        tts_exaggeration, tts_cfg_weight, tts_temperature, tts_language,
                        created_at, updated_at, active
                 FROM agents ORDER BY name",
            )
            .map_err(db_err)?;
        let rows = stmt.query_map([], row_to_agent).map_err(db_err)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row.map_err(db_err)??);
        }
        Ok(agents)
    }

    /// Delete an agent; sessions and messages cascade.
    pub fn delete_agent(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute("DELETE FROM agents WHERE id = ?1", [id.to_string()])
            .map_err(db_err)?;
        Ok(())
    }

    // ── sessions ──────────────────────────────────────────────

    /// Return the active session for `(user_id, ingress)`, creating one
    /// atomically when absent. Concurrent callers for the same pair all
    /// observe the same session.
    pub fn get_or_create_session(
        &self,
        user_id: &str,
        agent_id: Uuid,
        ingress: IngressKind,
    ) -> Result<Session> {
        let mut conn = self.conn.lock().expect("store lock poisoned");
        let tx = conn.transaction().map_err(db_err)?;

        let existing = tx
            .query_row(
                "SELECT id, user_id, agent_id, ingress, started_at, ended_at, active, metadata
                 FROM sessions
                 WHERE user_id = ?1 AND ingress = ?2 AND active = 1
                 ORDER BY started_at DESC LIMIT 1",
                params![user_id, ingress.as_str()],
                row_to_session,
            )
            .optional()
            .map_err(db_err)?;
        if let Some(session) = existing {
            tx.commit().map_err(db_err)?;
            return session;
        }

        let session = Session {
            id: Uuid::new_v4(),
            user_id: user_id.to_owned(),
            agent_id,
            ingress,
            started_at: Utc::now(),
            ended_at: None,
            active: true,
            metadata: serde_json::json!({}),
        };
        tx.execute(
            "INSERT INTO sessions (id, user_id, agent_id, ingress, started_at, active, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
            params![
                session.id.to_string(),
                session.user_id,
                session.agent_id.to_string(),
                session.ingress.as_str(),
                session.started_at.to_rfc3339(),
                session.metadata.to_string(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(session)
    }

    pub fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT id, user_id, agent_id, ingress, started_at, ended_at, active, metadata
             FROM sessions WHERE id = ?1",
            [id.to_string()],
            row_to_session,
        )
        .optional()
        .map_err(db_err)?
        .transpose()
    }

    /// Mark a session inactive. Sessions are never resurrected.
    pub fn end_session(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.execute(
            "UPDATE sessions SET active = 0, ended_at = ?2 WHERE id = ?1 AND active = 1",
            params![id.to_string(), Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Resolve the agent configuration a session runs with.
    pub fn get_agent_for_session(&self, session_id: Uuid) -> Result<Agent> {
        let conn = self.conn.lock().expect("store lock poisoned");
        conn.query_row(
            "SELECT a.id, a.name, a.system_prompt, a.provider, a.model, a.temperature,
                    a.tts_voice, a.tts_exaggeration, a.tts_cfg_weight, a.tts_temperature,
                    a.tts_language, a.created_at, a.updated_at, a.active
             FROM agents a JOIN sessions s ON s.agent_id = a.id
             WHERE s.id = ?1",
            [session_id.to_string()],
            row_to_agent,
        )
        .optional()
        .map_err(db_err)?
        .ok_or_else(|| GatewayError::Store(format!("no agent for session {session_id}")))?
    }

    // ── messages ──────────────────────────────────────────────

    /// Append one message. Returns only after the insert is durable.
    pub fn append_message(
        &self,
        session_id: Uuid,
        role: Role,
        content: &str,
        latency: Option<TurnLatency>,
    ) -> Result<Message> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let created_at = Utc::now();
        let lat = latency.unwrap_or_default();
        conn.execute(
            "INSERT INTO messages (session_id, role, content, created_at,
                 user_audio_ms, assistant_audio_ms, llm_first_chunk_ms, total_turn_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                session_id.to_string(),
                role.as_str(),
                content,
                created_at.to_rfc3339(),
                lat.user_audio_ms,
                lat.assistant_audio_ms,
                lat.llm_first_chunk_ms,
                lat.total_turn_ms,
            ],
        )
        .map_err(db_err)?;
        let id = conn.last_insert_rowid();
        Ok(Message {
            id,
            session_id,
            role,
            content: content.to_owned(),
            created_at,
            latency: latency.filter(|l| !l.is_empty()),
        })
    }

    /// The most recent `limit` messages of a session, in id order.
    pub fn recent_messages(&self, session_id: Uuid, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock().expect("store lock poisoned");
        let mut stmt = conn
            .prepare(
                "SELECT id, session_id, role, content, created_at,
                        user_audio_ms, assistant_audio_ms, llm_first_chunk_ms, total_turn_ms
                 FROM messages WHERE session_id = ?1
                 ORDER BY id DESC LIMIT ?2",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![session_id.to_string(), limit as i64], row_to_message)
            .map_err(db_err)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row.map_err(db_err)??);
        }
        messages.reverse();
        Ok(messages)
    }
}

type RowResult<T> = rusqlite::Result<Result<T>>;

fn row_to_agent(row: &rusqlite::Row<'_>) -> RowResult<Agent> {
    let id: String = row.get(0)?;
    let provider: String = row.get(3)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok((|| {
        Ok(Agent {
            id: Uuid::parse_str(&id)
                .map_err(|e| GatewayError::Store(format!("bad agent id: {e}")))?,
            name: row_get(row, 1)?,
            system_prompt: row_get(row, 2)?,
            provider: ProviderKind::parse(&provider)?,
            model: row_get(row, 4)?,
            temperature: row_get(row, 5)?,
            tts_voice: row_get(row, 6)?,
            tts_params: TtsParams {
                exaggeration: row_get(row, 7)?,
                cfg_weight: row_get(row, 8)?,
                temperature: row_get(row, 9)?,
                language: row_get(row, 10)?,
            },
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
            active: row_get(row, 13)?,
        })
    })())
}

fn row_to_session(row: &rusqlite::Row<'_>) -> RowResult<Session> {
    let id: String = row.get(0)?;
    let agent_id: String = row.get(2)?;
    let ingress: String = row.get(3)?;
    let started_at: String = row.get(4)?;
    let ended_at: Option<String> = row.get(5)?;
    let metadata: String = row.get(7)?;
    Ok((|| {
        Ok(Session {
            id: Uuid::parse_str(&id)
                .map_err(|e| GatewayError::Store(format!("bad session id: {e}")))?,
            user_id: row_get(row, 1)?,
            agent_id: Uuid::parse_str(&agent_id)
                .map_err(|e| GatewayError::Store(format!("bad agent id: {e}")))?,
            ingress: IngressKind::parse(&ingress)?,
            started_at: parse_ts(&started_at)?,
            ended_at: ended_at.as_deref().map(parse_ts).transpose()?,
            active: row_get(row, 6)?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| GatewayError::Store(format!("bad metadata: {e}")))?,
        })
    })())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> RowResult<Message> {
    let session_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    let latency = TurnLatency {
        user_audio_ms: row.get(5)?,
        assistant_audio_ms: row.get(6)?,
        llm_first_chunk_ms: row.get(7)?,
        total_turn_ms: row.get(8)?,
    };
    let id: i64 = row.get(0)?;
    Ok((|| {
        Ok(Message {
            id,
            session_id: Uuid::parse_str(&session_id)
                .map_err(|e| GatewayError::Store(format!("bad session id: {e}")))?,
            role: Role::parse(&role)?,
            content: row_get(row, 3)?,
            created_at: parse_ts(&created_at)?,
            latency: (!latency.is_empty()).then_some(latency),
        })
    })())
}

/// `row.get` with the rusqlite error flattened into ours. Used inside the
/// fallible half of the row mappers.
fn row_get<T: rusqlite::types::FromSql>(row: &rusqlite::Row<'_>, idx: usize) -> Result<T> {
    row.get(idx).map_err(db_err)
}
