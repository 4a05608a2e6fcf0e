//! Greedy token-budget selection over scored messages and entities
//!
//! This is a knapsack-shaped problem solved greedily by score rather than
//! optimally by value per token. The score already encodes value, and a
//! single deterministic pass is what makes cached results reproducible. A
//! cheap low-score item is therefore never swapped in for an expensive
//! high-score one, and allocation stops at the first item that does not fit.

use crate::config::ContextOptions;
use crate::context_engine::priority_scorer::{PrioritizedEntity, PrioritizedMessage};
use crate::memory::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// The bounded payload handed to prompt assembly and stored by the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizedContext {
    pub room_id: String,
    pub session_id: String,
    /// Selected messages, best-first.
    pub messages: Vec<PrioritizedMessage>,
    /// Selected entities, best-first.
    pub entities: Vec<PrioritizedEntity>,
    pub message_tokens: usize,
    pub entity_tokens: usize,
    pub total_tokens: usize,
    /// Budget left unused, `max_tokens - total_tokens`.
    pub available_tokens: usize,
    /// `total_tokens / tokens of every candidate`, 0 when there were none.
    pub compression_ratio: f32,
    pub included_messages: usize,
    pub excluded_messages: usize,
    pub included_entities: usize,
    pub excluded_entities: usize,
    pub built_at: DateTime<Utc>,
}

impl OptimizedContext {
    /// Selected messages in arrival order, for prompt assembly.
    pub fn chronological_messages(&self) -> Vec<&Message> {
        let mut messages: Vec<&Message> = self.messages.iter().map(|m| &m.message).collect();
        messages.sort_by_key(|m| m.id);
        messages
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.entities.is_empty()
    }
}

/// Share of `max_tokens` reserved for messages, as a fraction `NUM / DEN`.
const MESSAGE_SHARE_NUM: usize = 4;
const MESSAGE_SHARE_DEN: usize = 5;

#[derive(Debug, Default, Clone, Copy)]
pub struct BudgetAllocator;

impl BudgetAllocator {
    pub fn new() -> Self {
        Self
    }

    /// `floor(max_tokens * 4 / 5)` without overflowing on huge budgets.
    pub fn message_budget(max_tokens: usize) -> usize {
        (max_tokens / MESSAGE_SHARE_DEN) * MESSAGE_SHARE_NUM
            + (max_tokens % MESSAGE_SHARE_DEN) * MESSAGE_SHARE_NUM / MESSAGE_SHARE_DEN
    }

    /// Select from best-first candidate lists.
    ///
    /// Messages fill at most the message share of the budget, subject to
    /// `max_messages` and `priority_threshold`; entities then fill whatever
    /// the messages left, which may be more than the nominal remainder.
    pub fn allocate(
        &self,
        room_id: &str,
        session_id: &str,
        messages: Vec<PrioritizedMessage>,
        entities: Vec<PrioritizedEntity>,
        options: &ContextOptions,
        built_at: DateTime<Utc>,
    ) -> OptimizedContext {
        let candidate_messages = messages.len();
        let candidate_entities = entities.len();
        // Caller-supplied token counts may be arbitrarily large.
        let all_tokens = messages
            .iter()
            .map(|m| m.tokens)
            .chain(entities.iter().map(|e| e.tokens))
            .fold(0usize, usize::saturating_add);

        let message_budget = Self::message_budget(options.max_tokens);
        let mut message_tokens = 0usize;
        let mut selected_messages = Vec::new();

        for candidate in messages {
            if selected_messages.len() >= options.max_messages {
                break;
            }
            // Input is sorted, so nothing after a sub-threshold score qualifies.
            if candidate.priority_score < options.priority_threshold {
                break;
            }
            if message_tokens.saturating_add(candidate.tokens) > message_budget {
                break;
            }
            message_tokens += candidate.tokens;
            selected_messages.push(candidate);
        }

        let entity_budget = options.max_tokens - message_tokens;
        let mut entity_tokens = 0usize;
        let mut selected_entities = Vec::new();

        for candidate in entities {
            if candidate.priority_score < options.priority_threshold {
                break;
            }
            if entity_tokens.saturating_add(candidate.tokens) > entity_budget {
                break;
            }
            entity_tokens += candidate.tokens;
            selected_entities.push(candidate);
        }

        let total_tokens = message_tokens + entity_tokens;
        let compression_ratio = if all_tokens == 0 {
            0.0
        } else {
            total_tokens as f32 / all_tokens as f32
        };

        debug!(
            "Allocated {} messages and {} entities ({} of {} tokens) for room {}",
            selected_messages.len(),
            selected_entities.len(),
            total_tokens,
            options.max_tokens,
            room_id
        );

        OptimizedContext {
            room_id: room_id.to_string(),
            session_id: session_id.to_string(),
            included_messages: selected_messages.len(),
            excluded_messages: candidate_messages - selected_messages.len(),
            included_entities: selected_entities.len(),
            excluded_entities: candidate_entities - selected_entities.len(),
            messages: selected_messages,
            entities: selected_entities,
            message_tokens,
            entity_tokens,
            total_tokens,
            available_tokens: options.max_tokens - total_tokens,
            compression_ratio,
            built_at,
        }
    }
}
