//! The `ContextMemory` facade: the only entry point callers use
//!
//! A write goes to the store, then the room's cached contexts are dropped,
//! then the compaction check is fired in the background. A build is served
//! from the cache or computed from the store through the scorer and the
//! allocator.

use crate::config::{ContextOptions, EngineConfig};
use crate::context_engine::budget_allocator::{BudgetAllocator, OptimizedContext};
use crate::context_engine::context_cache::{CacheOutcome, ContextCache};
use crate::context_engine::entity_extractor::{EntityExtractor, ExtractedEntity, PatternEntityExtractor};
use crate::context_engine::priority_scorer::PriorityScorer;
use crate::context_engine::scene_detector::{KeywordSceneAnalyzer, SceneAnalyzer, SceneDetector};
use crate::context_engine::summarization::{
    CompactionReport, ExtractiveSummarizer, SchedulerSettings, SummarizationScheduler, Summarizer,
};
use crate::error::{EngineError, EngineResult};
use crate::memory::{
    AutoScene, Entity, Fact, Message, NewEntity, NewFact, NewMessage, NewSummary, RecordStore, Session,
    Summary, SummaryType,
};
use crate::utils::TextUtils;
use chrono::Utc;
use futures::future::try_join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Point-in-time copy of the engine's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub builds: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub invalidations: u64,
    pub compactions_started: u64,
    pub compactions_completed: u64,
    pub compactions_failed: u64,
    pub summaries_created: u64,
    pub scenes_detected: u64,
    pub cached_contexts: usize,
}

#[derive(Debug, Default)]
struct FacadeCounters {
    builds: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    invalidations: AtomicU64,
}

struct Inner {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    scorer: PriorityScorer,
    allocator: BudgetAllocator,
    cache: Arc<ContextCache>,
    scheduler: SummarizationScheduler,
    scene_detector: Arc<SceneDetector>,
    extractor: Option<Arc<dyn EntityExtractor>>,
    counters: FacadeCounters,
}

/// Cheap to clone; every clone shares the same cache and scheduler.
#[derive(Clone)]
pub struct ContextMemory {
    inner: Arc<Inner>,
}

pub struct ContextMemoryBuilder {
    store: Arc<dyn RecordStore>,
    config: EngineConfig,
    summarizer: Option<Arc<dyn Summarizer>>,
    scene_analyzer: Option<Arc<dyn SceneAnalyzer>>,
    entity_extractor: Option<Arc<dyn EntityExtractor>>,
}

impl ContextMemoryBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn scene_analyzer(mut self, analyzer: Arc<dyn SceneAnalyzer>) -> Self {
        self.scene_analyzer = Some(analyzer);
        self
    }

    /// Ignored when `extraction_enabled` is off.
    pub fn entity_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.entity_extractor = Some(extractor);
        self
    }

    /// Must be called from within a tokio runtime if messages will be recorded.
    pub fn build(self) -> ContextMemory {
        let config = self.config;
        let cache = Arc::new(ContextCache::new(config.cache_ttl));

        let analyzer = self
            .scene_analyzer
            .unwrap_or_else(|| Arc::new(KeywordSceneAnalyzer));
        let scene_detector = Arc::new(SceneDetector::new(config.scenes.clone(), analyzer));

        let summarizer = self
            .summarizer
            .unwrap_or_else(|| Arc::new(ExtractiveSummarizer::default()));
        let scheduler = SummarizationScheduler::new(
            Arc::clone(&self.store),
            summarizer,
            config.scene_detection_enabled.then(|| Arc::clone(&scene_detector)),
            Some(Arc::clone(&cache)),
            SchedulerSettings::from_config(&config),
        );

        let extractor = if config.extraction_enabled {
            Some(
                self.entity_extractor
                    .unwrap_or_else(|| Arc::new(PatternEntityExtractor)),
            )
        } else {
            None
        };

        info!(
            "Context memory initialized: {} max tokens, cache ttl {:?}, compaction at {} messages",
            config.context.max_tokens, config.cache_ttl, config.summary_trigger_threshold
        );

        ContextMemory {
            inner: Arc::new(Inner {
                store: self.store,
                scorer: PriorityScorer::new(config.scoring.clone()),
                allocator: BudgetAllocator::new(),
                config,
                cache,
                scheduler,
                scene_detector,
                extractor,
                counters: FacadeCounters::default(),
            }),
        }
    }
}

impl ContextMemory {
    pub fn new(store: Arc<dyn RecordStore>, config: EngineConfig) -> Self {
        Self::builder(store).config(config).build()
    }

    pub fn builder(store: Arc<dyn RecordStore>) -> ContextMemoryBuilder {
        ContextMemoryBuilder {
            store,
            config: EngineConfig::default(),
            summarizer: None,
            scene_analyzer: None,
            entity_extractor: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.inner.store
    }

    /// Select the messages and entities that best fit `options` for the
    /// room's open session.
    ///
    /// Fails with `NoOpenSession` when the room has none, `InvalidOptions`
    /// for a malformed request, `Timeout` when the build outlives
    /// `build_timeout`, and `Store` for anything the record store reports.
    pub async fn build_context(&self, room_id: &str, options: &ContextOptions) -> EngineResult<OptimizedContext> {
        options.validate()?;

        let limit = self.inner.config.build_timeout;
        match tokio::time::timeout(limit, self.inner.build_cached(room_id, options)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Context build for room {} timed out after {:?}", room_id, limit);
                Err(EngineError::Timeout(limit))
            }
        }
    }

    /// `build_context` with the configured default options.
    pub async fn build_default_context(&self, room_id: &str) -> EngineResult<OptimizedContext> {
        let options = self.inner.config.context.clone();
        self.build_context(room_id, &options).await
    }

    /// Append a message to the room's open session.
    ///
    /// Entity extraction runs before the cache is invalidated so entities it
    /// creates are visible to the next build. The compaction check is fired
    /// last and never waited on.
    pub async fn record_message(&self, room_id: &str, message: NewMessage) -> EngineResult<Message> {
        let session = self.inner.require_open_session(room_id).await?;
        let message = self.inner.store.append_message(&session.id, message).await?;
        debug!("Recorded message {} in session {}", message.id, session.id);

        self.inner.extract_entities(room_id, &message).await;
        self.invalidate(room_id);
        self.inner.scheduler.notify_message_written(room_id, &session.id);
        Ok(message)
    }

    /// Drop every cached context for the room. Returns how many were dropped.
    pub fn invalidate(&self, room_id: &str) -> usize {
        self.inner.counters.invalidations.fetch_add(1, Ordering::Relaxed);
        self.inner.cache.invalidate_room(room_id)
    }

    /// The room's open session, created if it has none.
    pub async fn open_session(&self, room_id: &str) -> EngineResult<Session> {
        let session = self.inner.store.open_session(room_id).await?;
        self.invalidate(room_id);
        info!("Room {} playing in session {}", room_id, session.id);
        Ok(session)
    }

    /// Close the room's open session. A closing summary, when given, is also
    /// recorded as a `session` summary over the whole transcript.
    pub async fn close_session(&self, room_id: &str, summary: Option<String>) -> EngineResult<()> {
        let session = self.inner.require_open_session(room_id).await?;

        if let Some(text) = &summary {
            let message_ids: Vec<i64> = self
                .inner
                .store
                .get_messages(&session.id, None)
                .await?
                .iter()
                .map(|m| m.id)
                .collect();
            self.inner
                .store
                .record_summary(NewSummary {
                    session_id: session.id.clone(),
                    summary_type: SummaryType::Session,
                    title: format!("Session {}", session.started_at.format("%Y-%m-%d")),
                    text: text.clone(),
                    message_ids,
                    token_count: TextUtils::estimate_tokens(text),
                })
                .await?;
        }

        self.inner.store.close_session(&session.id, summary).await?;
        self.invalidate(room_id);
        info!("Closed session {} for room {}", session.id, room_id);
        Ok(())
    }

    /// Create the entity, or merge into an existing one of the same type
    /// whose name matches case-insensitively. A merge replaces the
    /// description only when one is given and overwrites attributes key by key.
    pub async fn upsert_entity(&self, entity: NewEntity) -> EngineResult<Entity> {
        let room_id = entity.room_id.clone();
        let existing = self
            .inner
            .store
            .get_entities(&room_id, Some(entity.entity_type))
            .await?
            .into_iter()
            .find(|e| e.name.to_lowercase() == entity.name.to_lowercase());

        let stored = match existing {
            Some(mut current) => {
                if entity.description.is_some() {
                    current.description = entity.description;
                }
                current.attributes.extend(entity.attributes);
                current.updated_at = Utc::now();
                self.inner.store.update_entity(&current).await?
            }
            None => self.inner.store.create_entity(entity).await?,
        };

        self.invalidate(&room_id);
        Ok(stored)
    }

    pub async fn add_fact(&self, room_id: &str, fact: NewFact) -> EngineResult<Fact> {
        let fact = self.inner.store.add_fact(fact).await?;
        self.invalidate(room_id);
        Ok(fact)
    }

    /// Scenes in the open session's transcript. Nothing is persisted.
    pub async fn detect_scenes(&self, room_id: &str) -> EngineResult<Vec<AutoScene>> {
        let session = self.inner.require_open_session(room_id).await?;
        let messages = self.inner.store.get_messages(&session.id, None).await?;
        Ok(self.inner.scene_detector.detect(&session.id, &messages))
    }

    pub async fn session_summaries(&self, room_id: &str) -> EngineResult<Vec<Summary>> {
        let session = self.inner.require_open_session(room_id).await?;
        Ok(self.inner.store.get_summaries(&session.id).await?)
    }

    /// Compact the open session now, ignoring the trigger threshold.
    /// `Ok(None)` when a compaction for the session is already running.
    pub async fn compact_now(&self, room_id: &str) -> EngineResult<Option<CompactionReport>> {
        let session = self.inner.require_open_session(room_id).await?;
        Ok(self.inner.scheduler.compact_now(room_id, &session.id).await?)
    }

    /// Resolves once every background compaction check has finished.
    pub async fn wait_idle(&self) {
        self.inner.scheduler.wait_idle().await
    }

    pub fn purge_expired_cache(&self) -> usize {
        let purged = self.inner.cache.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired cached contexts", purged);
        }
        purged
    }

    pub fn stats(&self) -> EngineStats {
        let facade = &self.inner.counters;
        let scheduler = self.inner.scheduler.counters();
        EngineStats {
            builds: facade.builds.load(Ordering::Relaxed),
            cache_hits: facade.cache_hits.load(Ordering::Relaxed),
            cache_misses: facade.cache_misses.load(Ordering::Relaxed),
            invalidations: facade.invalidations.load(Ordering::Relaxed),
            compactions_started: scheduler.compactions_started.load(Ordering::Relaxed),
            compactions_completed: scheduler.compactions_completed.load(Ordering::Relaxed),
            compactions_failed: scheduler.compactions_failed.load(Ordering::Relaxed),
            summaries_created: scheduler.summaries_created.load(Ordering::Relaxed),
            scenes_detected: scheduler.scenes_detected.load(Ordering::Relaxed),
            cached_contexts: self.inner.cache.len(),
        }
    }
}

impl Inner {
    async fn require_open_session(&self, room_id: &str) -> EngineResult<Session> {
        self.store
            .get_open_session(room_id)
            .await?
            .ok_or_else(|| EngineError::NoOpenSession {
                room_id: room_id.to_string(),
            })
    }

    async fn build_cached(&self, room_id: &str, options: &ContextOptions) -> EngineResult<OptimizedContext> {
        // Read before the session so a close or reopen racing this build
        // keeps its result out of the cache.
        let generation = self.cache.generation(room_id);
        let session = self.require_open_session(room_id).await?;
        self.counters.builds.fetch_add(1, Ordering::Relaxed);

        let (context, outcome) = self
            .cache
            .get_or_build_since(room_id, options, generation, || self.compute(room_id, &session, options))
            .await?;

        match outcome {
            CacheOutcome::Hit => self.counters.cache_hits.fetch_add(1, Ordering::Relaxed),
            CacheOutcome::Miss | CacheOutcome::Bypassed => {
                self.counters.cache_misses.fetch_add(1, Ordering::Relaxed)
            }
        };
        Ok(context)
    }

    async fn compute(
        &self,
        room_id: &str,
        session: &Session,
        options: &ContextOptions,
    ) -> EngineResult<OptimizedContext> {
        let now = Utc::now();

        let mut messages = self
            .store
            .get_messages(&session.id, Some(self.config.message_window))
            .await?;
        if options.exclude_compressed {
            messages.retain(|m| !m.compressed);
        }

        let room_entities = self.store.get_entities(room_id, None).await?;
        let entity_names: Vec<String> = room_entities
            .iter()
            .map(|e| e.name.to_lowercase())
            .filter(|name| !name.trim().is_empty())
            .collect();

        let candidates: Vec<Entity> = if options.include_entities {
            room_entities
                .into_iter()
                .filter(|e| {
                    options
                        .entity_types
                        .as_ref()
                        .map_or(true, |types| types.contains(&e.entity_type))
                })
                .collect()
        } else {
            Vec::new()
        };

        let facts = try_join_all(candidates.iter().map(|e| self.store.get_facts(e.id))).await?;
        let with_fact_counts: Vec<(Entity, usize)> = candidates
            .into_iter()
            .zip(facts.iter().map(|f| f.len()))
            .collect();

        let scored_messages = self.scorer.score_messages(&messages, &entity_names, now);
        let scored_entities = self.scorer.score_entities(with_fact_counts, &messages, now);
        let context = self
            .allocator
            .allocate(room_id, &session.id, scored_messages, scored_entities, options, now);

        debug!(
            "Built context for room {}: {} messages, {} entities, {}/{} tokens",
            room_id,
            context.included_messages,
            context.included_entities,
            context.total_tokens,
            options.max_tokens
        );
        Ok(context)
    }

    async fn extract_entities(&self, room_id: &str, message: &Message) {
        let Some(extractor) = &self.extractor else {
            return;
        };

        let found: Vec<ExtractedEntity> = extractor
            .extract(&message.text)
            .into_iter()
            .filter(|e| e.confidence >= self.config.extraction_min_confidence)
            .collect();
        if found.is_empty() {
            return;
        }

        match self.persist_extracted(room_id, message, found).await {
            Ok(0) => {}
            Ok(created) => info!("Extracted {} new entities from message {}", created, message.id),
            Err(e) => warn!(
                "Entity extraction failed for message {} in room {}: {:#}",
                message.id, room_id, e
            ),
        }
    }

    async fn persist_extracted(
        &self,
        room_id: &str,
        message: &Message,
        found: Vec<ExtractedEntity>,
    ) -> anyhow::Result<usize> {
        let mut known: HashSet<String> = self
            .store
            .get_entities(room_id, None)
            .await?
            .into_iter()
            .map(|e| e.name.to_lowercase())
            .collect();

        let mut created = 0;
        for candidate in found {
            if !known.insert(candidate.name.to_lowercase()) {
                continue;
            }

            let mut new_entity = NewEntity::new(room_id, candidate.entity_type, candidate.name.clone());
            if let Some(description) = candidate.description {
                new_entity = new_entity.with_description(description);
            }
            let entity = self.store.create_entity(new_entity).await?;

            self.store
                .add_fact(
                    NewFact::new(entity.id, "first_mentioned", message.timestamp.to_rfc3339())
                        .with_confidence(candidate.confidence)
                        .from_message(message.id),
                )
                .await?;
            debug!("Created {} {} from message {}", entity.entity_type, entity.name, message.id);
            created += 1;
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{EntityType, InMemoryRecordStore};
    use serde_json::json;
    use std::time::Duration;

    fn engine_with(config: EngineConfig) -> (ContextMemory, Arc<InMemoryRecordStore>) {
        let store = Arc::new(InMemoryRecordStore::new());
        let engine = ContextMemory::new(store.clone(), config);
        (engine, store)
    }

    fn quiet_config() -> EngineConfig {
        EngineConfig {
            extraction_enabled: false,
            ..EngineConfig::default()
        }
    }

    #[tokio::test]
    async fn build_requires_open_session() {
        let (engine, _) = engine_with(quiet_config());
        let err = engine
            .build_context("room", &ContextOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoOpenSession { ref room_id } if room_id == "room"));
        assert!(err.is_caller_error());

        let err = engine
            .record_message("room", NewMessage::user("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoOpenSession { .. }));
    }

    #[tokio::test]
    async fn invalid_options_rejected_before_store_access() {
        let (engine, _) = engine_with(quiet_config());
        let err = engine
            .build_context("room", &ContextOptions::default().with_max_tokens(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));
        assert_eq!(engine.stats().builds, 0);
    }

    #[tokio::test]
    async fn second_build_is_a_cache_hit_until_a_write() {
        let (engine, _) = engine_with(quiet_config());
        engine.open_session("room").await.unwrap();
        engine.record_message("room", NewMessage::user("We enter the cave")).await.unwrap();

        let options = ContextOptions::default().with_priority_threshold(0.0);
        let first = engine.build_context("room", &options).await.unwrap();
        let second = engine.build_context("room", &options).await.unwrap();
        assert_eq!(first, second);
        let stats = engine.stats();
        assert_eq!((stats.cache_misses, stats.cache_hits), (1, 1));

        engine.record_message("room", NewMessage::assistant("It is dark.")).await.unwrap();
        let third = engine.build_context("room", &options).await.unwrap();
        assert_eq!(third.included_messages, 2);
        assert_eq!(engine.stats().cache_misses, 2);
        engine.wait_idle().await;
    }

    #[tokio::test]
    async fn upsert_merges_by_type_and_name() {
        let (engine, store) = engine_with(quiet_config());
        let first = engine
            .upsert_entity(NewEntity::new("room", EntityType::Npc, "Grimble").with_description("A goblin"))
            .await
            .unwrap();
        let merged = engine
            .upsert_entity(NewEntity::new("room", EntityType::Npc, "grimble").with_attribute("mood", json!("sly")))
            .await
            .unwrap();

        assert_eq!(first.id, merged.id);
        assert_eq!(merged.description.as_deref(), Some("A goblin"));
        assert_eq!(merged.attributes.get("mood"), Some(&json!("sly")));
        assert_eq!(store.get_entities("room", None).await.unwrap().len(), 1);

        let other_type = engine
            .upsert_entity(NewEntity::new("room", EntityType::Location, "Grimble"))
            .await
            .unwrap();
        assert_ne!(other_type.id, first.id);
    }

    #[tokio::test]
    async fn recorded_messages_seed_new_entities() {
        let (engine, store) = engine_with(EngineConfig::default());
        engine.open_session("room").await.unwrap();
        let message = engine
            .record_message("room", NewMessage::assistant("A goblin named Grimble blocks the bridge."))
            .await
            .unwrap();
        engine
            .record_message("room", NewMessage::user("I greet the goblin called Grimble."))
            .await
            .unwrap();

        let entities = store.get_entities("room", Some(EntityType::Npc)).await.unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].name, "Grimble");

        let facts = store.get_facts(entities[0].id).await.unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].key, "first_mentioned");
        assert_eq!(facts[0].source_message_id, Some(message.id));
        engine.wait_idle().await;
    }

    #[tokio::test]
    async fn close_session_records_session_summary() {
        let (engine, store) = engine_with(quiet_config());
        let session = engine.open_session("room").await.unwrap();
        engine.record_message("room", NewMessage::user("one")).await.unwrap();
        engine.record_message("room", NewMessage::user("two")).await.unwrap();
        engine.wait_idle().await;

        engine
            .close_session("room", Some("The party rested.".into()))
            .await
            .unwrap();
        assert!(store.get_open_session("room").await.unwrap().is_none());

        let summaries = store.get_summaries(&session.id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].summary_type, SummaryType::Session);
        assert_eq!(summaries[0].message_ids.len(), 2);

        let err = engine.close_session("room", None).await.unwrap_err();
        assert!(matches!(err, EngineError::NoOpenSession { .. }));
    }

    #[tokio::test]
    async fn entity_type_filter_and_exclusion() {
        let (engine, _) = engine_with(quiet_config());
        engine.open_session("room").await.unwrap();
        engine
            .upsert_entity(NewEntity::new("room", EntityType::Npc, "Vex"))
            .await
            .unwrap();
        engine
            .upsert_entity(NewEntity::new("room", EntityType::Location, "Thornwood"))
            .await
            .unwrap();
        engine
            .record_message("room", NewMessage::user("Vex points toward Thornwood."))
            .await
            .unwrap();

        let base = ContextOptions::default().with_priority_threshold(0.0);
        let only_npcs = engine
            .build_context("room", &base.clone().with_entity_types(vec![EntityType::Npc]))
            .await
            .unwrap();
        assert_eq!(only_npcs.included_entities, 1);
        assert_eq!(only_npcs.entities[0].entity.name, "Vex");

        let none = engine.build_context("room", &base.without_entities()).await.unwrap();
        assert!(none.entities.is_empty());
        assert_eq!(none.excluded_entities, 0);
        engine.wait_idle().await;
    }

    #[tokio::test]
    async fn detect_scenes_reports_without_persisting() {
        let (engine, store) = engine_with(quiet_config());
        let session = engine.open_session("room").await.unwrap();
        for (speaker, text) in [
            (Some("Aria"), "I attack the ogre"),
            (Some("Borin"), "I swing my hammer at its knee"),
            (None, "The ogre falls; a chest of gold lies behind it"),
            (Some("Cael"), "I check the chest for traps"),
            (Some("Aria"), "Open it"),
        ] {
            let message = match speaker {
                Some(name) => NewMessage::user(text).with_speaker(name),
                None => NewMessage::assistant(text),
            };
            engine.record_message("room", message).await.unwrap();
        }
        engine.wait_idle().await;

        let scenes = engine.detect_scenes("room").await.unwrap();
        assert_eq!(scenes.len(), 1);
        assert_eq!(scenes[0].session_id, session.id);
        assert_eq!(scenes[0].message_ids.len(), 5);
        assert!(scenes[0].key_events.contains(&"combat".to_string()));
        assert!(scenes[0].confidence > 0.7);

        assert!(engine.session_summaries("room").await.unwrap().is_empty());
        assert!(store.get_summaries(&session.id).await.unwrap().is_empty());
        assert_eq!(engine.stats().scenes_detected, 0);
    }

    #[tokio::test]
    async fn purge_drops_expired_contexts() {
        let (engine, _) = engine_with(EngineConfig {
            cache_ttl: Duration::from_millis(20),
            ..quiet_config()
        });
        engine.open_session("room").await.unwrap();
        engine.record_message("room", NewMessage::user("I keep watch")).await.unwrap();
        engine.wait_idle().await;

        engine.build_context("room", &ContextOptions::default()).await.unwrap();
        assert_eq!(engine.stats().cached_contexts, 1);
        assert_eq!(engine.purge_expired_cache(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.purge_expired_cache(), 1);
        assert_eq!(engine.stats().cached_contexts, 0);
    }
}
