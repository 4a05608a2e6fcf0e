//! Domain records and the record store contract consumed by the engine

pub mod in_memory;
pub mod types;

pub use in_memory::InMemoryRecordStore;
pub use types::*;

use async_trait::async_trait;

/// Durable storage of rooms, sessions, messages, entities, facts and summaries.
///
/// The engine never retries a store failure; errors flow back to the caller
/// unchanged. `get_messages` returns the most recent `limit` messages (all of
/// them when `None`) in chronological order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_open_session(&self, room_id: &str) -> anyhow::Result<Option<Session>>;

    /// Returns the room's open session, creating one if none exists.
    async fn open_session(&self, room_id: &str) -> anyhow::Result<Session>;

    async fn close_session(&self, session_id: &str, summary: Option<String>) -> anyhow::Result<()>;

    async fn get_messages(&self, session_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>>;

    async fn count_messages(&self, session_id: &str) -> anyhow::Result<usize>;

    async fn append_message(&self, session_id: &str, message: NewMessage) -> anyhow::Result<Message>;

    /// Sets `compressed = true` on the given messages; returns rows changed.
    async fn mark_compressed(&self, message_ids: &[i64]) -> anyhow::Result<usize>;

    async fn get_entities(
        &self,
        room_id: &str,
        entity_type: Option<EntityType>,
    ) -> anyhow::Result<Vec<Entity>>;

    async fn create_entity(&self, entity: NewEntity) -> anyhow::Result<Entity>;

    async fn update_entity(&self, entity: &Entity) -> anyhow::Result<Entity>;

    async fn get_facts(&self, entity_id: i64) -> anyhow::Result<Vec<Fact>>;

    async fn add_fact(&self, fact: NewFact) -> anyhow::Result<Fact>;

    /// Persists the summary together with its message links.
    async fn record_summary(&self, summary: NewSummary) -> anyhow::Result<Summary>;

    async fn get_summaries(&self, session_id: &str) -> anyhow::Result<Vec<Summary>>;
}
