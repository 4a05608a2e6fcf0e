//! Database schema for the SQLite record store
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row counts and file size for a `MemoryDatabase`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_sessions: i64,
    pub open_sessions: i64,
    pub total_messages: i64,
    pub compressed_messages: i64,
    pub total_entities: i64,
    pub total_facts: i64,
    pub total_summaries: i64,
    pub database_size_bytes: i64,
}

/// Base tables. Timestamps are RFC 3339 text.
pub const SCHEMA_SQL: &str = "
-- Sessions: at most one open (ended_at IS NULL) per room
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    started_at TIMESTAMP NOT NULL,
    ended_at TIMESTAMP,
    summary TEXT,
    token_count INTEGER NOT NULL DEFAULT 0
);
-- Messages
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    speaker_name TEXT,
    timestamp TIMESTAMP NOT NULL,
    token_count INTEGER,
    compressed BOOLEAN NOT NULL DEFAULT FALSE,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
-- Entities
CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    room_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    attributes TEXT NOT NULL DEFAULT '{}',
    created_at TIMESTAMP NOT NULL,
    updated_at TIMESTAMP NOT NULL
);
-- Facts
CREATE TABLE IF NOT EXISTS facts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    confidence REAL NOT NULL DEFAULT 1.0,
    source_message_id INTEGER,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (entity_id) REFERENCES entities(id) ON DELETE CASCADE
);
-- Summaries
CREATE TABLE IF NOT EXISTS summaries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    summary_type TEXT NOT NULL,
    title TEXT NOT NULL,
    summary_text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    created_at TIMESTAMP NOT NULL,
    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);
-- Summary -> message links
CREATE TABLE IF NOT EXISTS summary_messages (
    summary_id INTEGER NOT NULL,
    message_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (summary_id, message_id),
    FOREIGN KEY (summary_id) REFERENCES summaries(id) ON DELETE CASCADE,
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);
";

/// Lookup indexes, including the one-open-session-per-room guard.
pub const INDEXES_SQL: &str = "
CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_open_room ON sessions (room_id) WHERE ended_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_sessions_room ON sessions (room_id);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages (session_id, id);
CREATE INDEX IF NOT EXISTS idx_entities_room ON entities (room_id, entity_type);
CREATE INDEX IF NOT EXISTS idx_facts_entity ON facts (entity_id);
CREATE INDEX IF NOT EXISTS idx_summaries_session ON summaries (session_id);
CREATE INDEX IF NOT EXISTS idx_summary_messages_message ON summary_messages (message_id);
";

/// Parses the timestamp formats SQLite and chrono produce.
pub(crate) fn parse_datetime_safe(datetime_str: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(datetime_str) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(datetime_str, "%Y-%m-%d %H:%M:%S") {
        return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    None
}

pub(crate) fn parse_datetime_column(value: &str, column: &str) -> anyhow::Result<DateTime<Utc>> {
    parse_datetime_safe(value)
        .ok_or_else(|| anyhow::anyhow!("Failed to parse {} timestamp: {}", column, value))
}
