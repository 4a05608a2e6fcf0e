//! Record types shared by the engine and every record store

use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(anyhow::anyhow!("unknown message role: {}", other)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Character,
    Location,
    Npc,
    Item,
    Quest,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::Character,
        EntityType::Location,
        EntityType::Npc,
        EntityType::Item,
        EntityType::Quest,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Character => "character",
            EntityType::Location => "location",
            EntityType::Npc => "npc",
            EntityType::Item => "item",
            EntityType::Quest => "quest",
        }
    }
}

impl FromStr for EntityType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown entity type: {}", s))
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryType {
    Messages,
    Scene,
    Session,
}

impl SummaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryType::Messages => "messages",
            SummaryType::Scene => "scene",
            SummaryType::Session => "session",
        }
    }
}

impl FromStr for SummaryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messages" => Ok(SummaryType::Messages),
            "scene" => Ok(SummaryType::Scene),
            "session" => Ok(SummaryType::Session),
            other => Err(anyhow::anyhow!("unknown summary type: {}", other)),
        }
    }
}

/// A single transcript line. Immutable once written except for `compressed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub session_id: String,
    pub role: Role,
    pub text: String,
    pub speaker_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub token_count: Option<usize>,
    /// Set once the message has been folded into a summary. Never reset.
    pub compressed: bool,
}

impl Message {
    pub fn estimated_tokens(&self) -> usize {
        self.token_count
            .unwrap_or_else(|| TextUtils::estimate_tokens(&self.text))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub room_id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    /// Name + description + attribute map, each estimated separately.
    pub fn estimated_tokens(&self) -> usize {
        let mut tokens = TextUtils::estimate_tokens(&self.name);
        if let Some(description) = &self.description {
            tokens += TextUtils::estimate_tokens(description);
        }
        if !self.attributes.is_empty() {
            let serialized = serde_json::to_string(&self.attributes).unwrap_or_default();
            tokens += TextUtils::estimate_tokens(&serialized);
        }
        tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    pub entity_id: i64,
    pub key: String,
    pub value: String,
    /// In [0, 1].
    pub confidence: f32,
    pub source_message_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub room_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub token_count: usize,
}

impl Session {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Folded history. Summaries reference messages only, never other summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub id: i64,
    pub session_id: String,
    pub summary_type: SummaryType,
    pub title: String,
    pub text: String,
    pub message_ids: Vec<i64>,
    pub token_count: usize,
    pub created_at: DateTime<Utc>,
}

/// A heuristically detected sub-episode of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoScene {
    pub id: String,
    pub session_id: String,
    pub title: String,
    pub description: String,
    pub start_message_id: i64,
    pub end_message_id: i64,
    pub message_ids: Vec<i64>,
    pub participants: Vec<String>,
    pub key_events: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub text: String,
    pub speaker_name: Option<String>,
    pub token_count: Option<usize>,
    /// Defaults to the write time when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            speaker_name: None,
            token_count: None,
            timestamp: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker_name = Some(speaker.into());
        self
    }

    pub fn with_token_count(mut self, tokens: usize) -> Self {
        self.token_count = Some(tokens);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn estimated_tokens(&self) -> usize {
        self.token_count
            .unwrap_or_else(|| TextUtils::estimate_tokens(&self.text))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewEntity {
    pub room_id: String,
    pub entity_type: EntityType,
    pub name: String,
    pub description: Option<String>,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl NewEntity {
    pub fn new(room_id: impl Into<String>, entity_type: EntityType, name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            entity_type,
            name: name.into(),
            description: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub entity_id: i64,
    pub key: String,
    pub value: String,
    pub confidence: f32,
    pub source_message_id: Option<i64>,
}

impl NewFact {
    pub fn new(entity_id: i64, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_id,
            key: key.into(),
            value: value.into(),
            confidence: 1.0,
            source_message_id: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn from_message(mut self, message_id: i64) -> Self {
        self.source_message_id = Some(message_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewSummary {
    pub session_id: String,
    pub summary_type: SummaryType,
    pub title: String,
    pub text: String,
    pub message_ids: Vec<i64>,
    pub token_count: usize,
}
