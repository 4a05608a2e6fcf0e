//! Memory database module - SQLite-backed `RecordStore` for sessions, messages, entities and summaries
pub mod conversation_store;
pub mod entity_store;
pub mod migration;
pub mod schema;
pub mod summary_store;

pub use conversation_store::ConversationStore;
pub use entity_store::EntityStore;
pub use migration::MigrationManager;
pub use schema::DatabaseStats;
pub use summary_store::SummaryStore;

use crate::memory::{
    Entity, EntityType, Fact, Message, NewEntity, NewFact, NewMessage, NewSummary, RecordStore,
    Session, Summary,
};
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const CONNECTION_PRAGMAS: &str = "PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub struct MemoryDatabase {
    pub conversations: ConversationStore,
    pub entities: EntityStore,
    pub summaries: SummaryStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MemoryDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening context memory database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("Context memory database initialized successfully");
        Ok(Self::from_pool(pool))
    }

    /// Every connection to `:memory:` is a separate database, so the pool
    /// holds exactly one.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager =
            SqliteConnectionManager::memory().with_init(|conn| conn.execute_batch(CONNECTION_PRAGMAS));
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(pool))
    }

    fn from_pool(pool: Pool<SqliteConnectionManager>) -> Self {
        let pool = Arc::new(pool);
        Self {
            conversations: ConversationStore::new(Arc::clone(&pool)),
            entities: EntityStore::new(Arc::clone(&pool)),
            summaries: SummaryStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<DatabaseStats> {
        let conn = self.pool.get()?;
        Ok(migration::get_database_stats(&conn)?)
    }
}

#[async_trait]
impl RecordStore for MemoryDatabase {
    async fn get_open_session(&self, room_id: &str) -> anyhow::Result<Option<Session>> {
        self.conversations.get_open_session(room_id)
    }

    async fn open_session(&self, room_id: &str) -> anyhow::Result<Session> {
        self.conversations.open_session(room_id)
    }

    async fn close_session(&self, session_id: &str, summary: Option<String>) -> anyhow::Result<()> {
        self.conversations.close_session(session_id, summary)
    }

    async fn get_messages(&self, session_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
        self.conversations.get_messages(session_id, limit)
    }

    async fn count_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        self.conversations.count_messages(session_id)
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> anyhow::Result<Message> {
        self.conversations.append_message(session_id, message)
    }

    async fn mark_compressed(&self, message_ids: &[i64]) -> anyhow::Result<usize> {
        self.conversations.mark_compressed(message_ids)
    }

    async fn get_entities(
        &self,
        room_id: &str,
        entity_type: Option<EntityType>,
    ) -> anyhow::Result<Vec<Entity>> {
        self.entities.get_entities(room_id, entity_type)
    }

    async fn create_entity(&self, entity: NewEntity) -> anyhow::Result<Entity> {
        self.entities.create_entity(entity)
    }

    async fn update_entity(&self, entity: &Entity) -> anyhow::Result<Entity> {
        self.entities.update_entity(entity)
    }

    async fn get_facts(&self, entity_id: i64) -> anyhow::Result<Vec<Fact>> {
        self.entities.get_facts(entity_id)
    }

    async fn add_fact(&self, fact: NewFact) -> anyhow::Result<Fact> {
        self.entities.add_fact(fact)
    }

    async fn record_summary(&self, summary: NewSummary) -> anyhow::Result<Summary> {
        self.summaries.record_summary(summary)
    }

    async fn get_summaries(&self, session_id: &str) -> anyhow::Result<Vec<Summary>> {
        self.summaries.get_session_summaries(session_id)
    }
}

impl Drop for MemoryDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Role, SummaryType};
    use serde_json::json;

    #[tokio::test]
    async fn sessions_open_once_per_room() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let first = db.open_session("room").await.unwrap();
        let again = db.open_session("room").await.unwrap();
        assert_eq!(first.id, again.id);
        assert!(first.is_open());

        db.close_session(&first.id, Some("The party rests.".into())).await.unwrap();
        assert!(db.get_open_session("room").await.unwrap().is_none());

        let closed = db.conversations.get_session(&first.id).unwrap().unwrap();
        assert!(!closed.is_open());
        assert_eq!(closed.summary.as_deref(), Some("The party rests."));

        let next = db.open_session("room").await.unwrap();
        assert_ne!(next.id, first.id);
    }

    #[tokio::test]
    async fn messages_round_trip_with_limits_and_tokens() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.open_session("room").await.unwrap();

        for i in 0..5 {
            let msg = NewMessage::user(format!("line {i}")).with_speaker("Aria");
            db.append_message(&session.id, msg).await.unwrap();
        }
        db.append_message(&session.id, NewMessage::assistant("ok").with_token_count(7))
            .await
            .unwrap();

        assert_eq!(db.count_messages(&session.id).await.unwrap(), 6);
        let tail = db.get_messages(&session.id, Some(3)).await.unwrap();
        let texts: Vec<&str> = tail.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["line 3", "line 4", "ok"]);
        assert_eq!(tail[0].speaker_name.as_deref(), Some("Aria"));
        assert_eq!(tail[2].role, Role::Assistant);
        assert_eq!(tail[2].token_count, Some(7));

        // "line n" is 6 chars => 2 tokens each, plus 7 explicit
        let session = db.get_open_session("room").await.unwrap().unwrap();
        assert_eq!(session.token_count, 5 * 2 + 7);

        assert!(db.append_message("missing", NewMessage::user("x")).await.is_err());
    }

    #[tokio::test]
    async fn mark_compressed_only_counts_transitions() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.open_session("room").await.unwrap();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(db.append_message(&session.id, NewMessage::user(format!("m{i}"))).await.unwrap().id);
        }

        assert_eq!(db.mark_compressed(&ids[..2]).await.unwrap(), 2);
        assert_eq!(db.mark_compressed(&ids[..3]).await.unwrap(), 1);
        assert_eq!(db.mark_compressed(&[]).await.unwrap(), 0);

        let flags: Vec<bool> = db
            .get_messages(&session.id, None)
            .await
            .unwrap()
            .iter()
            .map(|m| m.compressed)
            .collect();
        assert_eq!(flags, vec![true, true, true, false]);
    }

    #[tokio::test]
    async fn mark_compressed_spans_more_ids_than_one_statement_binds() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.open_session("room").await.unwrap();
        let mut ids = Vec::new();
        for i in 0..1200 {
            ids.push(db.append_message(&session.id, NewMessage::user(format!("m{i}"))).await.unwrap().id);
        }

        assert_eq!(db.mark_compressed(&ids[..1100]).await.unwrap(), 1100);
        assert_eq!(db.mark_compressed(&ids).await.unwrap(), 100);

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.compressed_messages, 1200);
    }

    #[tokio::test]
    async fn session_token_count_saturates() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.open_session("room").await.unwrap();
        for _ in 0..2 {
            db.append_message(&session.id, NewMessage::user("a").with_token_count(usize::MAX))
                .await
                .unwrap();
        }
        db.append_message(&session.id, NewMessage::user("b")).await.unwrap();

        let session = db.get_open_session("room").await.unwrap().unwrap();
        assert_eq!(session.token_count, i64::MAX as usize);
        let messages = db.get_messages(&session.id, None).await.unwrap();
        assert_eq!(messages[0].token_count, Some(i64::MAX as usize));
    }

    #[tokio::test]
    async fn entities_and_facts_persist() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let created = db
            .create_entity(
                NewEntity::new("room", EntityType::Npc, "Grimble")
                    .with_description("A nervous goblin merchant")
                    .with_attribute("disposition", json!("friendly")),
            )
            .await
            .unwrap();
        db.create_entity(NewEntity::new("room", EntityType::Location, "Thornwood"))
            .await
            .unwrap();
        db.create_entity(NewEntity::new("other", EntityType::Npc, "Elsewhere"))
            .await
            .unwrap();

        let npcs = db.get_entities("room", Some(EntityType::Npc)).await.unwrap();
        assert_eq!(npcs.len(), 1);
        assert_eq!(npcs[0], created);
        assert_eq!(db.get_entities("room", None).await.unwrap().len(), 2);

        let mut edited = created.clone();
        edited.description = Some("A wealthy goblin merchant".into());
        let updated = db.update_entity(&edited).await.unwrap();
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(
            db.entities.get_entity(created.id).unwrap().unwrap().description,
            edited.description
        );

        db.add_fact(NewFact::new(created.id, "owes", "50 gold").with_confidence(0.8))
            .await
            .unwrap();
        let facts = db.get_facts(created.id).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert!((facts[0].confidence - 0.8).abs() < 1e-6);

        assert!(db.add_fact(NewFact::new(9999, "k", "v")).await.is_err());
    }

    #[tokio::test]
    async fn summaries_keep_their_message_links() {
        let db = MemoryDatabase::new_in_memory().unwrap();
        let session = db.open_session("room").await.unwrap();
        let mut ids = Vec::new();
        for i in 0..3 {
            ids.push(db.append_message(&session.id, NewMessage::user(format!("m{i}"))).await.unwrap().id);
        }

        let stored = db
            .record_summary(NewSummary {
                session_id: session.id.clone(),
                summary_type: SummaryType::Messages,
                title: "Opening".into(),
                text: "They met.".into(),
                message_ids: ids.clone(),
                token_count: 3,
            })
            .await
            .unwrap();

        let summaries = db.get_summaries(&session.id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].id, stored.id);
        assert_eq!(summaries[0].message_ids, ids);

        let stats = db.get_stats().unwrap();
        assert_eq!(stats.total_summaries, 1);
        assert_eq!(stats.total_messages, 3);
    }

    #[tokio::test]
    async fn file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");

        let session_id = {
            let db = MemoryDatabase::new(&path).unwrap();
            let session = db.open_session("room").await.unwrap();
            db.append_message(&session.id, NewMessage::user("persist me")).await.unwrap();
            session.id
        };

        let db = MemoryDatabase::new(&path).unwrap();
        let session = db.get_open_session("room").await.unwrap().unwrap();
        assert_eq!(session.id, session_id);
        assert_eq!(db.get_messages(&session_id, None).await.unwrap()[0].text, "persist me");
    }
}
