// context-memory/crates/context-memory/src/config.rs

use crate::error::EngineError;
use crate::memory::EntityType;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

/// Per-build selection options. Serialized form is part of the cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub max_tokens: usize,
    pub max_messages: usize,
    /// Minimum priority score in [0, 1] for any message or entity to be selected.
    pub priority_threshold: f32,
    pub include_entities: bool,
    /// Restrict entity candidates to these types; `None` means all types.
    pub entity_types: Option<Vec<EntityType>>,
    pub exclude_compressed: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_tokens: 4000,
            max_messages: 50,
            priority_threshold: 0.1,
            include_entities: true,
            entity_types: None,
            exclude_compressed: false,
        }
    }
}

impl ContextOptions {
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }

    pub fn with_priority_threshold(mut self, threshold: f32) -> Self {
        self.priority_threshold = threshold;
        self
    }

    pub fn with_entity_types(mut self, types: Vec<EntityType>) -> Self {
        self.entity_types = Some(types);
        self
    }

    pub fn without_entities(mut self) -> Self {
        self.include_entities = false;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidOptions("max_tokens must be positive".into()));
        }
        if self.max_messages == 0 {
            return Err(EngineError::InvalidOptions("max_messages must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.priority_threshold) {
            return Err(EngineError::InvalidOptions(format!(
                "priority_threshold must be within [0, 1], got {}",
                self.priority_threshold
            )));
        }
        Ok(())
    }
}

/// Tunables for the priority scorer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub message_decay_per_hour: f32,
    pub user_boost: f32,
    pub keyword_step: f32,
    pub entity_step: f32,
    pub recency_boost: f32,
    /// Tail length (by arrival order) that receives `recency_boost`.
    pub recency_window: usize,
    pub normalizer: f32,
    /// Caps on counted hits; `None` leaves the weights unbounded.
    pub max_keyword_hits: Option<usize>,
    pub max_entity_hits: Option<usize>,
    pub keywords: Vec<String>,

    pub entity_decay_per_hour: f32,
    /// Fact count at which `connection_weight` saturates to 1.
    pub connection_saturation: usize,
    pub frequency_weight: f32,
    pub recency_weight: f32,
    pub connection_weight: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            message_decay_per_hour: 0.1,
            user_boost: 1.2,
            keyword_step: 0.1,
            entity_step: 0.2,
            recency_boost: 2.0,
            recency_window: 10,
            normalizer: 5.0,
            max_keyword_hits: None,
            max_entity_hits: None,
            keywords: default_keywords(),
            entity_decay_per_hour: 0.05,
            connection_saturation: 10,
            frequency_weight: 0.4,
            recency_weight: 0.3,
            connection_weight: 0.3,
        }
    }
}

fn default_keywords() -> Vec<String> {
    [
        "attack", "damage", "spell", "cast", "roll", "initiative", "combat",
        "quest", "treasure", "gold", "magic", "dragon", "dungeon", "trap",
        "secret", "door", "potion", "weapon", "armor", "heal", "kill",
        "dies", "level", "saving throw", "hit points", "critical",
    ]
    .iter()
    .map(|k| k.to_string())
    .collect()
}

/// Scene segmentation and promotion thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDetectionConfig {
    pub max_gap: Duration,
    pub max_group_size: usize,
    pub min_group_size: usize,
    pub min_confidence: f32,
}

impl Default for SceneDetectionConfig {
    fn default() -> Self {
        Self {
            max_gap: Duration::from_secs(30 * 60),
            max_group_size: 20,
            min_group_size: 5,
            min_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Options used when a caller does not supply its own.
    pub context: ContextOptions,
    pub scoring: ScoringConfig,
    pub scenes: SceneDetectionConfig,
    pub cache_ttl: Duration,
    pub min_messages_for_summary: usize,
    pub summary_trigger_threshold: usize,
    /// Most recent messages that compaction never folds.
    pub keep_recent_messages: usize,
    pub scene_detection_enabled: bool,
    /// Most recent messages considered as build candidates.
    pub message_window: usize,
    pub build_timeout: Duration,
    pub extraction_enabled: bool,
    pub extraction_min_confidence: f32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context: ContextOptions::default(),
            scoring: ScoringConfig::default(),
            scenes: SceneDetectionConfig::default(),
            cache_ttl: Duration::from_secs(300),
            min_messages_for_summary: 10,
            summary_trigger_threshold: 100,
            keep_recent_messages: 20,
            scene_detection_enabled: true,
            message_window: 200,
            build_timeout: Duration::from_secs(10),
            extraction_enabled: true,
            extraction_min_confidence: 0.6,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by environment variables (and `.env` when present).
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("No .env file loaded ({}). Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();
        let context = ContextOptions {
            max_tokens: env_or("CONTEXT_MAX_TOKENS", defaults.context.max_tokens)?,
            max_messages: env_or("CONTEXT_MAX_MESSAGES", defaults.context.max_messages)?,
            priority_threshold: env_or(
                "CONTEXT_PRIORITY_THRESHOLD",
                defaults.context.priority_threshold,
            )?,
            ..defaults.context.clone()
        };
        context.validate().context("invalid CONTEXT_* configuration")?;

        let config = Self {
            context,
            cache_ttl: Duration::from_secs(env_or(
                "CONTEXT_CACHE_TTL_SECONDS",
                defaults.cache_ttl.as_secs(),
            )?),
            min_messages_for_summary: env_or(
                "MIN_MESSAGES_FOR_SUMMARY",
                defaults.min_messages_for_summary,
            )?,
            summary_trigger_threshold: env_or(
                "SUMMARY_TRIGGER_THRESHOLD",
                defaults.summary_trigger_threshold,
            )?,
            keep_recent_messages: env_or("KEEP_RECENT_MESSAGES", defaults.keep_recent_messages)?,
            scene_detection_enabled: env_or(
                "SCENE_DETECTION_ENABLED",
                defaults.scene_detection_enabled,
            )?,
            message_window: env_or("CONTEXT_MESSAGE_WINDOW", defaults.message_window)?,
            build_timeout: Duration::from_secs(env_or(
                "CONTEXT_BUILD_TIMEOUT_SECONDS",
                defaults.build_timeout.as_secs(),
            )?),
            extraction_enabled: env_or("ENTITY_EXTRACTION_ENABLED", defaults.extraction_enabled)?,
            ..defaults
        };

        info!(
            "Context memory configuration: {} tokens, {} messages, trigger at {} messages, cache ttl {:?}",
            config.context.max_tokens,
            config.context.max_messages,
            config.summary_trigger_threshold,
            config.cache_ttl
        );

        Ok(config)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.cache_ttl, Duration::from_secs(300));
        assert_eq!(config.summary_trigger_threshold, 100);
        assert_eq!(config.min_messages_for_summary, 10);
        assert_eq!(config.keep_recent_messages, 20);
        assert!(config.scene_detection_enabled);
        assert_eq!(config.scoring.recency_window, 10);
        assert!((config.scoring.frequency_weight
            + config.scoring.recency_weight
            + config.scoring.connection_weight
            - 1.0)
            .abs()
            < 1e-6);
    }

    #[test]
    fn validate_rejects_malformed_options() {
        assert!(ContextOptions::default().validate().is_ok());
        assert!(ContextOptions::default().with_max_tokens(0).validate().is_err());
        assert!(ContextOptions::default().with_max_messages(0).validate().is_err());
        assert!(ContextOptions::default()
            .with_priority_threshold(1.5)
            .validate()
            .is_err());
        assert!(ContextOptions::default()
            .with_priority_threshold(f32::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn env_or_parses_and_reports_bad_values() {
        env::set_var("CONTEXT_MEMORY_TEST_NUMBER", "42");
        assert_eq!(env_or("CONTEXT_MEMORY_TEST_NUMBER", 1usize).unwrap(), 42);
        env::set_var("CONTEXT_MEMORY_TEST_NUMBER", "forty-two");
        assert!(env_or("CONTEXT_MEMORY_TEST_NUMBER", 1usize).is_err());
        env::remove_var("CONTEXT_MEMORY_TEST_NUMBER");
        assert_eq!(env_or("CONTEXT_MEMORY_TEST_NUMBER", 7usize).unwrap(), 7);
    }

    #[test]
    fn from_env_overrides_defaults() {
        let overrides = [
            ("CONTEXT_MAX_TOKENS", "2500"),
            ("CONTEXT_MAX_MESSAGES", "40"),
            ("CONTEXT_PRIORITY_THRESHOLD", "0.25"),
            ("CONTEXT_CACHE_TTL_SECONDS", "60"),
            ("MIN_MESSAGES_FOR_SUMMARY", "5"),
            ("SUMMARY_TRIGGER_THRESHOLD", "80"),
            ("KEEP_RECENT_MESSAGES", "12"),
            ("SCENE_DETECTION_ENABLED", "false"),
            ("CONTEXT_MESSAGE_WINDOW", "150"),
            ("CONTEXT_BUILD_TIMEOUT_SECONDS", "3"),
            ("ENTITY_EXTRACTION_ENABLED", "false"),
        ];
        for (key, value) in overrides {
            env::set_var(key, value);
        }

        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.context.max_tokens, 2500);
        assert_eq!(config.context.max_messages, 40);
        assert_eq!(config.context.priority_threshold, 0.25);
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
        assert_eq!(config.min_messages_for_summary, 5);
        assert_eq!(config.summary_trigger_threshold, 80);
        assert_eq!(config.keep_recent_messages, 12);
        assert!(!config.scene_detection_enabled);
        assert_eq!(config.message_window, 150);
        assert_eq!(config.build_timeout, Duration::from_secs(3));
        assert!(!config.extraction_enabled);
        assert_eq!(config.scoring, ScoringConfig::default());

        env::set_var("CONTEXT_MAX_TOKENS", "0");
        assert!(EngineConfig::from_env().is_err());

        for (key, _) in overrides {
            env::remove_var(key);
        }
        assert_eq!(EngineConfig::from_env().unwrap(), EngineConfig::default());
    }
}
