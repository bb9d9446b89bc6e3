//! SQLite schema for the conversation store.

use rusqlite::Connection;

/// Current schema version, recorded in `meta`.
pub const SCHEMA_VERSION: u32 = 1;

/// Apply pragmas and create all tables when absent.
///
/// Foreign keys carry the cascade rule: deleting an agent removes its
/// sessions and their messages.
pub fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    // journal_mode replies with the resulting mode, so it cannot go
    // through pragma_update.
    let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS agents (
             id               TEXT PRIMARY KEY,
             name             TEXT NOT NULL UNIQUE,
             system_prompt    TEXT NOT NULL,
             provider         TEXT NOT NULL,
             model            TEXT NOT NULL,
             temperature      REAL NOT NULL,
             tts_voice        TEXT NOT NULL,
             tts_exaggeration REAL NOT NULL,
             tts_cfg_weight   REAL NOT NULL,
             tts_temperature  REAL NOT NULL,
             tts_language     TEXT NOT NULL,
             created_at       TEXT NOT NULL,
             updated_at       TEXT NOT NULL,
             active           INTEGER NOT NULL DEFAULT 1
         );

         CREATE TABLE IF NOT EXISTS sessions (
             id         TEXT PRIMARY KEY,
             user_id    TEXT NOT NULL,
             agent_id   TEXT NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             ingress    TEXT NOT NULL,
             started_at TEXT NOT NULL,
             ended_at   TEXT,
             active     INTEGER NOT NULL DEFAULT 1,
             metadata   TEXT NOT NULL DEFAULT '{}'
         );

         CREATE INDEX IF NOT EXISTS idx_sessions_user_active
             ON sessions(user_id, ingress, active);

         CREATE TABLE IF NOT EXISTS messages (
             id                 INTEGER PRIMARY KEY AUTOINCREMENT,
             session_id         TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
             role               TEXT NOT NULL,
             content            TEXT NOT NULL,
             created_at         TEXT NOT NULL,
             user_audio_ms      INTEGER,
             assistant_audio_ms INTEGER,
             llm_first_chunk_ms INTEGER,
             total_turn_ms      INTEGER
         );

         CREATE INDEX IF NOT EXISTS idx_messages_session
             ON messages(session_id, id);
        ",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Read the recorded schema version.
pub fn schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = 'schema_version'",
        [],
        |row| {
            let raw: String = row.get(0)?;
            Ok(raw.parse().unwrap_or(0))
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_applies_and_records_version() {
        let conn = Connection::open_in_memory().expect("open");
        apply_schema(&conn).expect("apply");
        assert_eq!(schema_version(&conn).expect("version"), SCHEMA_VERSION);
        // Idempotent.
        apply_schema(&conn).expect("re-apply");
    }
}
