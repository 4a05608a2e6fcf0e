//! TTL cache of built contexts, keyed by room and option fingerprint
//!
//! Entries move `fresh -> stale -> absent`; a stale entry is never refreshed,
//! only evicted (lazily on lookup or eagerly via `purge_expired`). Room
//! invalidation ignores the options half of the key.
//!
//! Each room carries a generation counter bumped by every invalidation. A
//! build records the generation before it reads the store and may only
//! publish its result if the generation has not moved, so a build that
//! raced a write can never be served after that write.

use crate::config::ContextOptions;
use crate::context_engine::budget_allocator::OptimizedContext;
use crate::error::EngineResult;
use dashmap::DashMap;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub room_id: String,
    pub fingerprint: String,
}

impl CacheKey {
    /// `None` if the options cannot be serialized; callers then build uncached.
    pub fn new(room_id: &str, options: &ContextOptions) -> Option<Self> {
        match serde_json::to_vec(options) {
            Ok(bytes) => Some(Self {
                room_id: room_id.to_string(),
                fingerprint: blake3::hash(&bytes).to_hex().to_string(),
            }),
            Err(e) => {
                warn!("Failed to fingerprint context options for room {}: {}", room_id, e);
                None
            }
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    context: OptimizedContext,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Whether `get_or_build` served a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
    /// Built without a key; nothing was looked up or stored.
    Bypassed,
}

pub struct ContextCache {
    entries: DashMap<CacheKey, CacheEntry>,
    generations: DashMap<String, u64>,
    ttl: Duration,
}

impl ContextCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            generations: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &CacheKey) -> Option<OptimizedContext> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<OptimizedContext> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(now) {
            return Some(entry.context.clone());
        }
        drop(entry);

        // Only evict if nobody re-inserted a fresh entry meanwhile.
        self.entries.remove_if(key, |_, entry| !entry.is_fresh(now));
        debug!("Evicted stale context for room {}", key.room_id);
        None
    }

    pub fn generation(&self, room_id: &str) -> u64 {
        self.generations.get(room_id).map(|g| *g).unwrap_or(0)
    }

    /// Stores `context` unless the room was invalidated after `generation`
    /// was read. Returns whether the entry was stored.
    pub fn insert_if_current(&self, key: CacheKey, context: OptimizedContext, generation: u64) -> bool {
        self.insert_if_current_at(key, context, generation, Instant::now())
    }

    pub fn insert_if_current_at(
        &self,
        key: CacheKey,
        context: OptimizedContext,
        generation: u64,
        now: Instant,
    ) -> bool {
        // The generation entry stays locked until the insert lands, so an
        // invalidation either happens-before (we skip) or after (it evicts us).
        let current = self.generations.entry(key.room_id.clone()).or_insert(0);
        if *current != generation {
            debug!(
                "Discarding context for room {} built at generation {} (now {})",
                key.room_id, generation, *current
            );
            return false;
        }
        self.entries.insert(
            key,
            CacheEntry {
                context,
                expires_at: now + self.ttl,
            },
        );
        true
    }

    /// Drops every entry for the room, whatever its options. Returns how many.
    pub fn invalidate_room(&self, room_id: &str) -> usize {
        {
            let mut generation = self.generations.entry(room_id.to_string()).or_insert(0);
            *generation = generation.wrapping_add(1);
        }

        let before = self.entries.len();
        self.entries.retain(|key, _| key.room_id != room_id);
        let removed = before.saturating_sub(self.entries.len());
        debug!("Invalidated {} cached contexts for room {}", removed, room_id);
        removed
    }

    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Serve a fresh entry or run `build` and publish its result.
    ///
    /// Concurrent misses for the same key each run `build`; the results are
    /// equivalent so whichever lands last wins. Build errors are returned
    /// and nothing is stored.
    pub async fn get_or_build<F, Fut>(
        &self,
        room_id: &str,
        options: &ContextOptions,
        build: F,
    ) -> EngineResult<(OptimizedContext, CacheOutcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<OptimizedContext>>,
    {
        let generation = self.generation(room_id);
        self.get_or_build_since(room_id, options, generation, build).await
    }

    /// Like `get_or_build`, publishing only if the room is still at
    /// `generation`. Callers that read the store before consulting the cache
    /// pass the generation they saw before that read.
    pub async fn get_or_build_since<F, Fut>(
        &self,
        room_id: &str,
        options: &ContextOptions,
        generation: u64,
        build: F,
    ) -> EngineResult<(OptimizedContext, CacheOutcome)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<OptimizedContext>>,
    {
        let Some(key) = CacheKey::new(room_id, options) else {
            return Ok((build().await?, CacheOutcome::Bypassed));
        };

        if let Some(context) = self.get(&key) {
            debug!("Context cache hit for room {}", room_id);
            return Ok((context, CacheOutcome::Hit));
        }

        debug!("Context cache miss for room {}", room_id);
        let context = build().await?;
        self.insert_if_current(key, context.clone(), generation);
        Ok((context, CacheOutcome::Miss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(room_id: &str, total_tokens: usize) -> OptimizedContext {
        OptimizedContext {
            room_id: room_id.into(),
            session_id: "s".into(),
            messages: Vec::new(),
            entities: Vec::new(),
            message_tokens: total_tokens,
            entity_tokens: 0,
            total_tokens,
            available_tokens: 0,
            compression_ratio: 0.0,
            included_messages: 0,
            excluded_messages: 0,
            included_entities: 0,
            excluded_entities: 0,
            built_at: Utc::now(),
        }
    }

    fn key(room_id: &str, max_tokens: usize) -> CacheKey {
        CacheKey::new(room_id, &ContextOptions::default().with_max_tokens(max_tokens)).unwrap()
    }

    #[test]
    fn fingerprint_depends_on_options() {
        assert_eq!(key("room", 100), key("room", 100));
        assert_ne!(key("room", 100), key("room", 200));
        assert_ne!(key("room", 100), key("other", 100));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = ContextCache::new(Duration::from_secs(300));
        let now = Instant::now();
        let k = key("room", 100);
        assert!(cache.insert_if_current_at(k.clone(), context("room", 1), 0, now));

        assert!(cache.get_at(&k, now + Duration::from_secs(299)).is_some());
        assert!(cache.get_at(&k, now + Duration::from_secs(300)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidation_is_room_wide_and_room_scoped() {
        let cache = ContextCache::new(Duration::from_secs(300));
        cache.insert_if_current(key("room", 100), context("room", 1), 0);
        cache.insert_if_current(key("room", 200), context("room", 2), 0);
        cache.insert_if_current(key("other", 100), context("other", 3), 0);

        assert_eq!(cache.invalidate_room("room"), 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key("other", 100)).is_some());
        assert_eq!(cache.generation("room"), 1);
        assert_eq!(cache.generation("other"), 0);
    }

    #[test]
    fn stale_generation_is_not_published() {
        let cache = ContextCache::new(Duration::from_secs(300));
        let generation = cache.generation("room");
        cache.invalidate_room("room");

        assert!(!cache.insert_if_current(key("room", 100), context("room", 1), generation));
        assert!(cache.get(&key("room", 100)).is_none());
    }

    #[test]
    fn purge_removes_only_stale_entries() {
        let cache = ContextCache::new(Duration::from_secs(10));
        let now = Instant::now();
        cache.insert_if_current_at(key("room", 1), context("room", 1), 0, now);
        cache.insert_if_current_at(key("room", 2), context("room", 2), 0, now + Duration::from_secs(8));

        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(12)), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn get_or_build_memoizes_and_skips_errors() {
        let cache = ContextCache::new(Duration::from_secs(300));
        let options = ContextOptions::default();
        let builds = AtomicUsize::new(0);
        let counter = &builds;

        let build = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(context("room", 7))
        };
        let (first, outcome) = cache.get_or_build("room", &options, build).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);

        let build = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(context("room", 8))
        };
        let (second, outcome) = cache.get_or_build("room", &options, build).await.unwrap();
        assert_eq!(outcome, CacheOutcome::Hit);
        assert_eq!(first, second);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        cache.invalidate_room("room");
        let failed = cache
            .get_or_build("room", &options, || async {
                Err(EngineError::InvalidOptions("boom".into()))
            })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn invalidation_during_build_discards_result() {
        let cache = ContextCache::new(Duration::from_secs(300));
        let options = ContextOptions::default();
        let shared = &cache;

        let (_, outcome) = cache
            .get_or_build("room", &options, move || async move {
                shared.invalidate_room("room");
                Ok(context("room", 1))
            })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn generation_read_before_the_build_guards_publication() {
        let cache = ContextCache::new(Duration::from_secs(300));
        let options = ContextOptions::default();
        let seen = cache.generation("room");
        cache.invalidate_room("room");

        let (_, outcome) = cache
            .get_or_build_since("room", &options, seen, || async { Ok(context("room", 3)) })
            .await
            .unwrap();
        assert_eq!(outcome, CacheOutcome::Miss);
        assert!(cache.is_empty());

        let current = cache.generation("room");
        cache
            .get_or_build_since("room", &options, current, || async { Ok(context("room", 3)) })
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
    }
}
