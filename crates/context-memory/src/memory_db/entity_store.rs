//! Entity and fact storage operations
use crate::memory::{Entity, EntityType, Fact, NewEntity, NewFact};
use crate::memory_db::schema::parse_datetime_column;
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const ENTITY_COLUMNS: &str =
    "id, room_id, entity_type, name, description, attributes, created_at, updated_at";

pub struct EntityStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl EntityStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn get_entities(&self, room_id: &str, entity_type: Option<EntityType>) -> anyhow::Result<Vec<Entity>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM entities
             WHERE room_id = ?1 AND (?2 IS NULL OR entity_type = ?2)
             ORDER BY id",
            ENTITY_COLUMNS
        ))?;
        let mut rows = stmt.query(params![room_id, entity_type.map(|t| t.as_str())])?;
        let mut entities = Vec::new();
        while let Some(row) = rows.next()? {
            entities.push(row_to_entity(row)?);
        }
        Ok(entities)
    }

    pub fn get_entity(&self, entity_id: i64) -> anyhow::Result<Option<Entity>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS))?;
        let mut rows = stmt.query([entity_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_entity(row)?)),
            None => Ok(None),
        }
    }

    pub fn create_entity(&self, entity: NewEntity) -> anyhow::Result<Entity> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        conn.execute(
            "INSERT INTO entities
             (room_id, entity_type, name, description, attributes, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
            params![
                &entity.room_id,
                entity.entity_type.as_str(),
                &entity.name,
                &entity.description,
                serde_json::to_string(&entity.attributes)?,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!("Created {} entity {} ({}) in room {}", entity.entity_type, id, entity.name, entity.room_id);

        Ok(Entity {
            id,
            room_id: entity.room_id,
            entity_type: entity.entity_type,
            name: entity.name,
            description: entity.description,
            attributes: entity.attributes,
            created_at: now,
            updated_at: now,
        })
    }

    /// Overwrites the mutable columns and bumps `updated_at`.
    pub fn update_entity(&self, entity: &Entity) -> anyhow::Result<Entity> {
        let conn = self.get_conn()?;
        let now = Utc::now();
        let updated = conn.execute(
            "UPDATE entities
             SET entity_type = ?2, name = ?3, description = ?4, attributes = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                entity.id,
                entity.entity_type.as_str(),
                &entity.name,
                &entity.description,
                serde_json::to_string(&entity.attributes)?,
                now.to_rfc3339(),
            ],
        )?;
        if updated == 0 {
            return Err(anyhow::anyhow!("Entity {} not found", entity.id));
        }

        let mut stored = entity.clone();
        stored.updated_at = now;
        Ok(stored)
    }

    pub fn get_facts(&self, entity_id: i64) -> anyhow::Result<Vec<Fact>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, entity_id, key, value, confidence, source_message_id, created_at
             FROM facts WHERE entity_id = ?1 ORDER BY id",
        )?;
        let mut rows = stmt.query([entity_id])?;
        let mut facts = Vec::new();
        while let Some(row) = rows.next()? {
            facts.push(row_to_fact(row)?);
        }
        Ok(facts)
    }

    pub fn add_fact(&self, fact: NewFact) -> anyhow::Result<Fact> {
        let conn = self.get_conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM entities WHERE id = ?1)",
            [fact.entity_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(anyhow::anyhow!("Entity {} not found", fact.entity_id));
        }

        let now = Utc::now();
        conn.execute(
            "INSERT INTO facts (entity_id, key, value, confidence, source_message_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fact.entity_id,
                &fact.key,
                &fact.value,
                fact.confidence as f64,
                fact.source_message_id,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Fact {
            id: conn.last_insert_rowid(),
            entity_id: fact.entity_id,
            key: fact.key,
            value: fact.value,
            confidence: fact.confidence,
            source_message_id: fact.source_message_id,
            created_at: now,
        })
    }
}

fn row_to_entity(row: &Row) -> anyhow::Result<Entity> {
    let entity_type: EntityType = row.get::<_, String>(2)?.parse()?;
    let attributes_json: String = row.get(5)?;
    let attributes: BTreeMap<String, serde_json::Value> = serde_json::from_str(&attributes_json)
        .map_err(|e| anyhow::anyhow!("Failed to parse entity attributes: {}", e))?;

    Ok(Entity {
        id: row.get(0)?,
        room_id: row.get(1)?,
        entity_type,
        name: row.get(3)?,
        description: row.get(4)?,
        attributes,
        created_at: parse_datetime_column(&row.get::<_, String>(6)?, "created_at")?,
        updated_at: parse_datetime_column(&row.get::<_, String>(7)?, "updated_at")?,
    })
}

fn row_to_fact(row: &Row) -> anyhow::Result<Fact> {
    Ok(Fact {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
        confidence: row.get::<_, f64>(4)? as f32,
        source_message_id: row.get(5)?,
        created_at: parse_datetime_column(&row.get::<_, String>(6)?, "fact")?,
    })
}
