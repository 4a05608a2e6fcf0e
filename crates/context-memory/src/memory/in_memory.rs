use crate::memory::types::*;
use crate::memory::RecordStore;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Process-local record store backed by concurrent maps.
///
/// Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: DashMap<String, Session>,
    open_sessions: DashMap<String, String>,
    messages: DashMap<String, Vec<Message>>,
    message_sessions: DashMap<i64, String>,
    entities: DashMap<i64, Entity>,
    facts: DashMap<i64, Vec<Fact>>,
    summaries: DashMap<String, Vec<Summary>>,
    next_id: AtomicI64,
}

impl Inner {
    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get_open_session(&self, room_id: &str) -> anyhow::Result<Option<Session>> {
        let Some(session_id) = self.inner.open_sessions.get(room_id).map(|s| s.clone()) else {
            return Ok(None);
        };
        Ok(self.inner.sessions.get(&session_id).map(|s| s.clone()))
    }

    async fn open_session(&self, room_id: &str) -> anyhow::Result<Session> {
        let inner = &self.inner;
        let session_id = inner
            .open_sessions
            .entry(room_id.to_string())
            .or_insert_with(|| {
                let session = Session {
                    id: Uuid::new_v4().to_string(),
                    room_id: room_id.to_string(),
                    started_at: Utc::now(),
                    ended_at: None,
                    summary: None,
                    token_count: 0,
                };
                let id = session.id.clone();
                inner.sessions.insert(id.clone(), session);
                id
            })
            .clone();

        inner
            .sessions
            .get(&session_id)
            .map(|s| s.clone())
            .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))
    }

    async fn close_session(&self, session_id: &str, summary: Option<String>) -> anyhow::Result<()> {
        let room_id = {
            let mut session = self
                .inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))?;
            if session.ended_at.is_none() {
                session.ended_at = Some(Utc::now());
            }
            if summary.is_some() {
                session.summary = summary;
            }
            session.room_id.clone()
        };
        self.inner
            .open_sessions
            .remove_if(&room_id, |_, open_id| open_id == session_id);
        Ok(())
    }

    async fn get_messages(&self, session_id: &str, limit: Option<usize>) -> anyhow::Result<Vec<Message>> {
        let Some(messages) = self.inner.messages.get(session_id) else {
            return Ok(Vec::new());
        };
        let skip = limit.map_or(0, |limit| messages.len().saturating_sub(limit));
        Ok(messages[skip..].to_vec())
    }

    async fn count_messages(&self, session_id: &str) -> anyhow::Result<usize> {
        Ok(self.inner.messages.get(session_id).map_or(0, |m| m.len()))
    }

    async fn append_message(&self, session_id: &str, message: NewMessage) -> anyhow::Result<Message> {
        let tokens = message.estimated_tokens();
        {
            let mut session = self
                .inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| anyhow::anyhow!("Session {} not found", session_id))?;
            session.token_count = session.token_count.saturating_add(tokens);
        }

        // Id assignment happens under the per-session lock so ids follow arrival order.
        let mut messages = self.inner.messages.entry(session_id.to_string()).or_default();
        let stored = Message {
            id: self.inner.next_id(),
            session_id: session_id.to_string(),
            role: message.role,
            text: message.text,
            speaker_name: message.speaker_name,
            timestamp: message.timestamp.unwrap_or_else(Utc::now),
            token_count: message.token_count,
            compressed: false,
        };
        messages.push(stored.clone());
        self.inner
            .message_sessions
            .insert(stored.id, session_id.to_string());
        Ok(stored)
    }

    async fn mark_compressed(&self, message_ids: &[i64]) -> anyhow::Result<usize> {
        let mut changed = 0;
        for id in message_ids {
            let Some(session_id) = self.inner.message_sessions.get(id).map(|s| s.clone()) else {
                continue;
            };
            if let Some(mut messages) = self.inner.messages.get_mut(&session_id) {
                if let Ok(pos) = messages.binary_search_by_key(id, |m| m.id) {
                    if !messages[pos].compressed {
                        messages[pos].compressed = true;
                        changed += 1;
                    }
                }
            }
        }
        Ok(changed)
    }

    async fn get_entities(
        &self,
        room_id: &str,
        entity_type: Option<EntityType>,
    ) -> anyhow::Result<Vec<Entity>> {
        let mut entities: Vec<Entity> = self
            .inner
            .entities
            .iter()
            .filter(|e| e.room_id == room_id)
            .filter(|e| entity_type.is_none_or(|t| e.entity_type == t))
            .map(|e| e.clone())
            .collect();
        entities.sort_by_key(|e| e.id);
        Ok(entities)
    }

    async fn create_entity(&self, entity: NewEntity) -> anyhow::Result<Entity> {
        let now = Utc::now();
        let stored = Entity {
            id: self.inner.next_id(),
            room_id: entity.room_id,
            entity_type: entity.entity_type,
            name: entity.name,
            description: entity.description,
            attributes: entity.attributes,
            created_at: now,
            updated_at: now,
        };
        self.inner.entities.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn update_entity(&self, entity: &Entity) -> anyhow::Result<Entity> {
        let mut stored = self
            .inner
            .entities
            .get_mut(&entity.id)
            .ok_or_else(|| anyhow::anyhow!("Entity {} not found", entity.id))?;
        stored.entity_type = entity.entity_type;
        stored.name = entity.name.clone();
        stored.description = entity.description.clone();
        stored.attributes = entity.attributes.clone();
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn get_facts(&self, entity_id: i64) -> anyhow::Result<Vec<Fact>> {
        Ok(self
            .inner
            .facts
            .get(&entity_id)
            .map(|f| f.clone())
            .unwrap_or_default())
    }

    async fn add_fact(&self, fact: NewFact) -> anyhow::Result<Fact> {
        if !self.inner.entities.contains_key(&fact.entity_id) {
            return Err(anyhow::anyhow!("Entity {} not found", fact.entity_id));
        }
        let stored = Fact {
            id: self.inner.next_id(),
            entity_id: fact.entity_id,
            key: fact.key,
            value: fact.value,
            confidence: fact.confidence,
            source_message_id: fact.source_message_id,
            created_at: Utc::now(),
        };
        self.inner
            .facts
            .entry(fact.entity_id)
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn record_summary(&self, summary: NewSummary) -> anyhow::Result<Summary> {
        let stored = Summary {
            id: self.inner.next_id(),
            session_id: summary.session_id,
            summary_type: summary.summary_type,
            title: summary.title,
            text: summary.text,
            message_ids: summary.message_ids,
            token_count: summary.token_count,
            created_at: Utc::now(),
        };
        self.inner
            .summaries
            .entry(stored.session_id.clone())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn get_summaries(&self, session_id: &str) -> anyhow::Result<Vec<Summary>> {
        Ok(self
            .inner
            .summaries
            .get(session_id)
            .map(|s| s.clone())
            .unwrap_or_default())
    }
}
