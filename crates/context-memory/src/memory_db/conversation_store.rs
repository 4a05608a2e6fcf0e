//! Session and message storage operations
use crate::memory::{Message, NewMessage, Role, Session};
use crate::memory_db::schema::parse_datetime_column;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const MARK_COMPRESSED_CHUNK: usize = 500;

const SESSION_COLUMNS: &str = "id, room_id, started_at, ended_at, summary, token_count";
const MESSAGE_COLUMNS: &str =
    "id, session_id, role, content, speaker_name, timestamp, token_count, compressed";

pub struct ConversationStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ConversationStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get_session(&self, session_id: &str) -> anyhow::Result<Option<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS))?;
        let mut rows = stmt.query([session_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    pub fn get_open_session(&self, room_id: &str) -> anyhow::Result<Option<Session>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sessions WHERE room_id = ?1 AND ended_at IS NULL",
            SESSION_COLUMNS
        ))?;
        let mut rows = stmt.query([room_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    /// Returns the room's open session, creating it inside an immediate
    /// transaction so concurrent callers observe the same session.
    pub fn open_session(&self, room_id: &str) -> anyhow::Result<Session> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM sessions WHERE room_id = ?1 AND ended_at IS NULL",
                    SESSION_COLUMNS
                ),
                [room_id],
                |row| Ok(row_to_session(row)),
            )
            .optional()?
            .transpose()?;

        if let Some(session) = existing {
            tx.commit()?;
            return Ok(session);
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            summary: None,
            token_count: 0,
        };
        tx.execute(
            "INSERT INTO sessions (id, room_id, started_at, token_count) VALUES (?1, ?2, ?3, 0)",
            params![&session.id, &session.room_id, session.started_at.to_rfc3339()],
        )?;
        tx.commit()?;

        info!("Opened session {} for room {}", session.id, room_id);
        Ok(session)
    }

    pub fn close_session(&self, session_id: &str, summary: Option<String>) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let updated = conn.execute(
            "UPDATE sessions
             SET ended_at = COALESCE(ended_at, ?2), summary = COALESCE(?3, summary)
             WHERE id = ?1",
            params![session_id, Utc::now().to_rfc3339(), summary],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Session {} not found", session_id));
        }
        info!("Closed session {}", session_id);
        Ok(())
    }

    /// Most recent `limit` messages (all when `None`), oldest first.
    pub fn get_messages(&self, session_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
        let conn = self.get_conn()?;
        let limit = limit.map_or(-1, |l| l as i64);
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM (
                 SELECT {cols} FROM messages WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2
             ) ORDER BY id ASC",
            cols = MESSAGE_COLUMNS
        ))?;
        let mut rows = stmt.query(params![session_id, limit])?;
        let mut messages = Vec::new();
        while let Some(row) = rows.next()? {
            messages.push(row_to_message(row)?);
        }
        Ok(messages)
    }

    pub fn count_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            [session_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Inserts the message and adds its estimated tokens to the session total.
    pub fn append_message(&self, session_id: &str, message: NewMessage) -> anyhow::Result<Message> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tokens = message.estimated_tokens();
        // Saturates at i64::MAX instead of letting SQLite promote to REAL.
        let updated = tx.execute(
            "UPDATE sessions SET token_count = CASE
                 WHEN token_count > ?3 - ?2 THEN ?3
                 ELSE token_count + ?2
             END
             WHERE id = ?1",
            params![session_id, saturating_i64(tokens), i64::MAX],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Session {} not found", session_id));
        }

        let timestamp = message.timestamp.unwrap_or_else(Utc::now);
        tx.execute(
            "INSERT INTO messages
             (session_id, role, content, speaker_name, timestamp, token_count, compressed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, FALSE)",
            params![
                session_id,
                message.role.as_str(),
                &message.text,
                &message.speaker_name,
                timestamp.to_rfc3339(),
                message.token_count.map(saturating_i64),
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        debug!("Stored message {} in session {}", id, session_id);
        Ok(Message {
            id,
            session_id: session_id.to_string(),
            role: message.role,
            text: message.text,
            speaker_name: message.speaker_name,
            timestamp,
            token_count: message.token_count,
            compressed: false,
        })
    }

    pub fn mark_compressed(&self, message_ids: &[i64]) -> anyhow::Result<usize> {
        if message_ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut changed = 0;
        // Keeps each statement under SQLite's bound-parameter limit.
        for chunk in message_ids.chunks(MARK_COMPRESSED_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(",");
            let query = format!(
                "UPDATE messages SET compressed = TRUE WHERE compressed = FALSE AND id IN ({})",
                placeholders
            );
            changed += tx.execute(&query, rusqlite::params_from_iter(chunk))?;
        }
        tx.commit()?;
        debug!("Marked {} of {} messages compressed", changed, message_ids.len());
        Ok(changed)
    }
}

fn saturating_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn row_to_session(row: &Row) -> anyhow::Result<Session> {
    let started_at = parse_datetime_column(&row.get::<_, String>(2)?, "started_at")?;
    let ended_at = row
        .get::<_, Option<String>>(3)?
        .map(|s| parse_datetime_column(&s, "ended_at"))
        .transpose()?;

    Ok(Session {
        id: row.get(0)?,
        room_id: row.get(1)?,
        started_at,
        ended_at,
        summary: row.get(4)?,
        token_count: row.get::<_, i64>(5)?.max(0) as usize,
    })
}

fn row_to_message(row: &Row) -> anyhow::Result<Message> {
    let role: Role = row.get::<_, String>(2)?.parse()?;
    let timestamp = parse_datetime_column(&row.get::<_, String>(5)?, "message")?;

    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role,
        text: row.get(3)?,
        speaker_name: row.get(4)?,
        timestamp,
        token_count: row.get::<_, Option<i64>>(6)?.map(|t| t.max(0) as usize),
        compressed: row.get(7)?,
    })
}
