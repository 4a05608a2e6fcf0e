//! Summary storage and retrieval operations
use crate::memory::{NewSummary, Summary, SummaryType};
use crate::memory_db::schema::parse_datetime_column;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, Row};
use std::sync::Arc;
use tracing::debug;

pub struct SummaryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SummaryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Inserts the summary and its message links in one transaction.
    pub fn record_summary(&self, summary: NewSummary) -> anyhow::Result<Summary> {
        let mut conn = self.get_conn()?;
        let now = Utc::now();

        debug!(
            "Storing {} summary for session {} over {} messages",
            summary.summary_type.as_str(),
            summary.session_id,
            summary.message_ids.len()
        );

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO summaries
             (session_id, summary_type, title, summary_text, token_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &summary.session_id,
                summary.summary_type.as_str(),
                &summary.title,
                &summary.text,
                summary.token_count as i64,
                now.to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        {
            let mut link = tx.prepare(
                "INSERT OR IGNORE INTO summary_messages (summary_id, message_id, position)
                 VALUES (?1, ?2, ?3)",
            )?;
            for (position, message_id) in summary.message_ids.iter().enumerate() {
                link.execute(params![id, message_id, position as i64])?;
            }
        }
        tx.commit()?;

        Ok(Summary {
            id,
            session_id: summary.session_id,
            summary_type: summary.summary_type,
            title: summary.title,
            text: summary.text,
            message_ids: summary.message_ids,
            token_count: summary.token_count,
            created_at: now,
        })
    }

    /// Summaries for a session in creation order, message links included.
    pub fn get_session_summaries(&self, session_id: &str) -> anyhow::Result<Vec<Summary>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, summary_type, title, summary_text, token_count, created_at
             FROM summaries WHERE session_id = ?1 ORDER BY id",
        )?;

        let mut rows = stmt.query([session_id])?;
        let mut summaries = Vec::new();
        while let Some(row) = rows.next()? {
            let mut summary = row_to_summary(row)?;
            summary.message_ids = linked_message_ids(&conn, summary.id)?;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

fn linked_message_ids(conn: &Connection, summary_id: i64) -> anyhow::Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT message_id FROM summary_messages WHERE summary_id = ?1 ORDER BY position",
    )?;
    let ids = stmt
        .query_map([summary_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(ids)
}

fn row_to_summary(row: &Row) -> anyhow::Result<Summary> {
    let summary_type: SummaryType = row.get::<_, String>(2)?.parse()?;
    Ok(Summary {
        id: row.get(0)?,
        session_id: row.get(1)?,
        summary_type,
        title: row.get(3)?,
        text: row.get(4)?,
        message_ids: Vec::new(),
        token_count: row.get::<_, i64>(5)?.max(0) as usize,
        created_at: parse_datetime_column(&row.get::<_, String>(6)?, "summary")?,
    })
}
