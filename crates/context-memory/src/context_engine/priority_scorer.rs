//! Relevance scoring for transcript messages and room entities
//!
//! Scoring is a pure function of the item, the scoring configuration and the
//! moment `now`; it knows nothing about budgets. Both score kinds land in
//! [0, 1] so they can serve as a sort key and as a threshold test.

use crate::config::ScoringConfig;
use crate::memory::{Entity, Message, Role};
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Named sub-weights behind a message score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MessageWeights {
    pub time: f32,
    pub participant: f32,
    pub keyword: f32,
    pub entity: f32,
    pub recency: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedMessage {
    pub message: Message,
    pub priority_score: f32,
    pub weights: MessageWeights,
    pub tokens: usize,
}

/// Named sub-weights behind an entity score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EntityWeights {
    pub frequency: f32,
    pub recency: f32,
    pub connection: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrioritizedEntity {
    pub entity: Entity,
    pub priority_score: f32,
    pub weights: EntityWeights,
    pub mentions: usize,
    pub fact_count: usize,
    pub tokens: usize,
}

/// Mention statistics for one entity over a message window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EntitySignals {
    pub mentions: usize,
    pub last_mention: DateTime<Utc>,
    pub fact_count: usize,
}

pub struct PriorityScorer {
    config: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a single message. `entity_names` must be lowercased.
    pub fn score_message(
        &self,
        message: &Message,
        entity_names: &[String],
        in_recent_window: bool,
        now: DateTime<Utc>,
    ) -> (f32, MessageWeights) {
        let text_lower = message.text.to_lowercase();
        self.score_message_lower(message, &text_lower, entity_names, in_recent_window, now)
    }

    fn score_message_lower(
        &self,
        message: &Message,
        text_lower: &str,
        entity_names: &[String],
        in_recent_window: bool,
        now: DateTime<Utc>,
    ) -> (f32, MessageWeights) {
        let weights = MessageWeights {
            time: self.time_weight(message.timestamp, now),
            participant: self.participant_weight(message.role),
            keyword: self.keyword_weight(text_lower),
            entity: self.entity_mention_weight(text_lower, entity_names),
            recency: if in_recent_window { self.config.recency_boost } else { 1.0 },
        };

        let product = weights.time * weights.participant * weights.keyword * weights.entity * weights.recency;
        let score = normalize(product / self.config.normalizer.max(f32::EPSILON));
        (score, weights)
    }

    /// Score every message and return them best-first.
    ///
    /// `messages` must be in arrival order; the last `recency_window` of them
    /// receive the recency boost regardless of their timestamps. Equal scores
    /// keep arrival order.
    pub fn score_messages(
        &self,
        messages: &[Message],
        entity_names: &[String],
        now: DateTime<Utc>,
    ) -> Vec<PrioritizedMessage> {
        let recent_start = messages.len().saturating_sub(self.config.recency_window);

        let mut scored: Vec<PrioritizedMessage> = messages
            .iter()
            .enumerate()
            .map(|(idx, message)| {
                let text_lower = message.text.to_lowercase();
                let (priority_score, weights) =
                    self.score_message_lower(message, &text_lower, entity_names, idx >= recent_start, now);
                PrioritizedMessage {
                    message: message.clone(),
                    priority_score,
                    weights,
                    tokens: message.estimated_tokens(),
                }
            })
            .collect();

        sort_best_first(&mut scored, |m| m.priority_score);
        scored
    }

    fn time_weight(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
        (-self.config.message_decay_per_hour * hours_since(timestamp, now)).exp()
    }

    fn participant_weight(&self, role: Role) -> f32 {
        match role {
            Role::User => self.config.user_boost,
            Role::Assistant | Role::System => 1.0,
        }
    }

    fn keyword_weight(&self, text_lower: &str) -> f32 {
        let mut hits = TextUtils::count_distinct_terms(text_lower, &self.config.keywords);
        if let Some(cap) = self.config.max_keyword_hits {
            hits = hits.min(cap);
        }
        1.0 + self.config.keyword_step * hits as f32
    }

    fn entity_mention_weight(&self, text_lower: &str, entity_names: &[String]) -> f32 {
        let mut hits = TextUtils::count_distinct_terms(text_lower, entity_names);
        if let Some(cap) = self.config.max_entity_hits {
            hits = hits.min(cap);
        }
        1.0 + self.config.entity_step * hits as f32
    }

    /// Mentions are counted per message (case-insensitive name match). An
    /// entity that is never mentioned falls back to its `updated_at`.
    pub fn entity_signals(entity: &Entity, messages: &[Message], fact_count: usize) -> EntitySignals {
        let name = entity.name.to_lowercase();
        let mut mentions = 0;
        let mut last_mention: Option<DateTime<Utc>> = None;

        if !name.trim().is_empty() {
            for message in messages {
                if message.text.to_lowercase().contains(&name) {
                    mentions += 1;
                    last_mention = Some(last_mention.map_or(message.timestamp, |t| t.max(message.timestamp)));
                }
            }
        }

        EntitySignals {
            mentions,
            last_mention: last_mention.unwrap_or(entity.updated_at),
            fact_count,
        }
    }

    pub fn score_entity(
        &self,
        signals: &EntitySignals,
        max_mentions: usize,
        now: DateTime<Utc>,
    ) -> (f32, EntityWeights) {
        let frequency = if max_mentions == 0 {
            0.0
        } else {
            signals.mentions as f32 / max_mentions as f32
        };
        let recency = (-self.config.entity_decay_per_hour * hours_since(signals.last_mention, now)).exp();
        let connection = if self.config.connection_saturation == 0 {
            1.0
        } else {
            (signals.fact_count as f32 / self.config.connection_saturation as f32).min(1.0)
        };

        let weights = EntityWeights {
            frequency,
            recency,
            connection,
        };
        let score = self.config.frequency_weight * frequency
            + self.config.recency_weight * recency
            + self.config.connection_weight * connection;
        (normalize(score), weights)
    }

    /// Score entities against a message window and return them best-first.
    pub fn score_entities(
        &self,
        entities: Vec<(Entity, usize)>,
        messages: &[Message],
        now: DateTime<Utc>,
    ) -> Vec<PrioritizedEntity> {
        let signals: Vec<(Entity, EntitySignals)> = entities
            .into_iter()
            .map(|(entity, fact_count)| {
                let signals = Self::entity_signals(&entity, messages, fact_count);
                (entity, signals)
            })
            .collect();

        let max_mentions = signals.iter().map(|(_, s)| s.mentions).max().unwrap_or(0);

        let mut scored: Vec<PrioritizedEntity> = signals
            .into_iter()
            .map(|(entity, signals)| {
                let (priority_score, weights) = self.score_entity(&signals, max_mentions, now);
                let tokens = entity.estimated_tokens();
                PrioritizedEntity {
                    entity,
                    priority_score,
                    weights,
                    mentions: signals.mentions,
                    fact_count: signals.fact_count,
                    tokens,
                }
            })
            .collect();

        sort_best_first(&mut scored, |e| e.priority_score);
        scored
    }
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self::new(ScoringConfig::default())
    }
}

/// Hours elapsed from `then` to `now`; timestamps in the future count as now.
fn hours_since(then: DateTime<Utc>, now: DateTime<Utc>) -> f32 {
    let millis = now.signed_duration_since(then).num_milliseconds().max(0);
    millis as f32 / 3_600_000.0
}

fn normalize(score: f32) -> f32 {
    if score.is_finite() {
        score.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Stable descending sort; ties keep their input order.
fn sort_best_first<T>(items: &mut [T], score: impl Fn(&T) -> f32) {
    items.sort_by(|a, b| score(b).total_cmp(&score(a)));
}
