//! Background compaction of session transcripts
//!
//! Every durable message write calls `notify_message_written`, which spawns a
//! check and returns at once. Once a session holds at least
//! `trigger_threshold` messages and at least `min_messages` sit outside the
//! `keep_recent` tail, the uncompressed ones among them are folded into one
//! `messages` summary, and only after that summary is recorded are they
//! marked compressed. At most one compaction per session runs at a time; a
//! trigger that finds one in flight marks the session pending, and whoever
//! holds the slot re-checks once it lets go, so the last write of a burst is
//! never lost. A compaction that marks messages invalidates the room's
//! cached contexts.

use crate::config::EngineConfig;
use crate::context_engine::context_cache::ContextCache;
use crate::context_engine::scene_detector::SceneDetector;
use crate::memory::{Message, NewSummary, RecordStore, Role, Summary, SummaryType};
use crate::utils::{TextUtils, TopicExtractor};
use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct SummaryDraft {
    pub title: String,
    pub text: String,
}

/// Turns a run of messages into summary text. May call out to a model.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft>;
}

/// Participants, key topics, and the opening and closing lines.
pub struct ExtractiveSummarizer {
    topics: TopicExtractor,
    max_chars: usize,
    quote_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self {
            topics: TopicExtractor::default(),
            max_chars: 600,
            quote_chars: 120,
        }
    }
}

impl ExtractiveSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars,
            ..Self::default()
        }
    }

    fn quote(&self, message: &Message) -> String {
        let text = TextUtils::normalize_whitespace(&message.text);
        let text = TextUtils::truncate_with_ellipsis(&text, self.quote_chars);
        match &message.speaker_name {
            Some(speaker) => format!("{}: \"{}\"", speaker, text),
            None => format!("{}: \"{}\"", message.role, text),
        }
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft> {
        let spoken: Vec<&Message> = messages.iter().filter(|m| m.role != Role::System).collect();
        let (Some(first), Some(last)) = (spoken.first(), spoken.last()) else {
            return Err(anyhow::anyhow!("No dialogue to summarize in {} messages", messages.len()));
        };

        let mut participants: Vec<String> = Vec::new();
        for message in &spoken {
            let name = message
                .speaker_name
                .clone()
                .unwrap_or_else(|| message.role.to_string());
            if !participants.contains(&name) {
                participants.push(name);
            }
        }
        let topics = self.topics.extract_from_messages(messages);

        let title = if topics.is_empty() {
            format!("Messages {}-{}", first.id, last.id)
        } else {
            format!("Messages {}-{}: {}", first.id, last.id, topics.join(", "))
        };

        let mut text = format!(
            "{} messages with {}.",
            messages.len(),
            participants.join(", ")
        );
        if !topics.is_empty() {
            text.push_str(&format!(" Key topics: {}.", topics.join(", ")));
        }
        text.push_str(&format!(" Opened with {}", self.quote(first)));
        if spoken.len() > 1 {
            text.push_str(&format!(" Closed with {}", self.quote(last)));
        }

        Ok(SummaryDraft {
            title,
            text: TextUtils::truncate_with_ellipsis(&text, self.max_chars).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SchedulerSettings {
    pub trigger_threshold: usize,
    pub min_messages: usize,
    pub keep_recent: usize,
}

impl SchedulerSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            trigger_threshold: config.summary_trigger_threshold,
            min_messages: config.min_messages_for_summary,
            keep_recent: config.keep_recent_messages,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Outcome of one compaction attempt that was allowed to run.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionReport {
    pub session_id: String,
    /// `None` when fewer than `min_messages` were eligible.
    pub summary: Option<Summary>,
    pub compressed: usize,
    pub scenes: Vec<Summary>,
}

#[derive(Debug, Default)]
pub struct SchedulerCounters {
    pub compactions_started: AtomicU64,
    pub compactions_completed: AtomicU64,
    pub compactions_failed: AtomicU64,
    pub summaries_created: AtomicU64,
    pub scenes_detected: AtomicU64,
}

/// Removes the session from the in-flight set however the attempt ends.
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    session_id: String,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a DashSet<String>, session_id: &str) -> Option<Self> {
        if set.insert(session_id.to_string()) {
            Some(Self {
                set,
                session_id: session_id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.session_id);
    }
}

struct SchedulerInner {
    store: Arc<dyn RecordStore>,
    summarizer: Arc<dyn Summarizer>,
    scene_detector: Option<Arc<SceneDetector>>,
    cache: Option<Arc<ContextCache>>,
    settings: SchedulerSettings,
    in_flight: DashSet<String>,
    /// Sessions whose trigger arrived while a compaction was in flight.
    pending: DashSet<String>,
    active: AtomicUsize,
    idle: Notify,
    counters: SchedulerCounters,
}

/// Counts a spawned check until it finishes, panics included.
struct ActiveTask(Arc<SchedulerInner>);

impl ActiveTask {
    fn start(inner: &Arc<SchedulerInner>) -> Self {
        inner.active.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for ActiveTask {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone)]
pub struct SummarizationScheduler {
    inner: Arc<SchedulerInner>,
}

impl SummarizationScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        summarizer: Arc<dyn Summarizer>,
        scene_detector: Option<Arc<SceneDetector>>,
        cache: Option<Arc<ContextCache>>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                summarizer,
                scene_detector,
                cache,
                settings,
                in_flight: DashSet::new(),
                pending: DashSet::new(),
                active: AtomicUsize::new(0),
                idle: Notify::new(),
                counters: SchedulerCounters::default(),
            }),
        }
    }

    pub fn settings(&self) -> SchedulerSettings {
        self.inner.settings
    }

    pub fn counters(&self) -> &SchedulerCounters {
        &self.inner.counters
    }

    pub fn is_in_flight(&self, session_id: &str) -> bool {
        self.inner.in_flight.contains(session_id)
    }

    /// Spawn the threshold check for `session_id` and return immediately.
    /// Must be called from within a tokio runtime.
    pub fn notify_message_written(&self, room_id: &str, session_id: &str) {
        let tracker = ActiveTask::start(&self.inner);
        let inner = Arc::clone(&self.inner);
        let room_id = room_id.to_string();
        let session_id = session_id.to_string();

        tokio::spawn(async move {
            let _tracker = tracker;
            if let Err(e) = inner.check_threshold(&room_id, &session_id).await {
                warn!("Summarization check failed for session {}: {:#}", session_id, e);
            }
        });
    }

    /// Compact now regardless of the trigger threshold. `Ok(None)` when a
    /// compaction for the session is already running.
    pub async fn compact_now(&self, room_id: &str, session_id: &str) -> anyhow::Result<Option<CompactionReport>> {
        self.inner.compact(room_id, session_id).await
    }

    /// Resolves once no spawned check is pending or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl SchedulerInner {
    async fn check_threshold(&self, room_id: &str, session_id: &str) -> anyhow::Result<()> {
        loop {
            let count = self.store.count_messages(session_id).await?;
            if count < self.settings.trigger_threshold {
                return Ok(());
            }

            // Marked before trying the slot, so a holder that releases after
            // our failed attempt is guaranteed to see the mark.
            self.pending.insert(session_id.to_string());
            let Some(guard) = InFlightGuard::acquire(&self.in_flight, session_id) else {
                debug!("Compaction in flight for session {}, deferring check", session_id);
                return Ok(());
            };
            self.pending.remove(session_id);
            debug!(
                "Session {} has {} messages (threshold {}), compacting",
                session_id, count, self.settings.trigger_threshold
            );
            let outcome = self.compact_guarded(room_id, session_id).await;
            drop(guard);

            if self.pending.remove(session_id).is_none() {
                return outcome.map(|_| ());
            }
            if let Err(e) = outcome {
                warn!("Compaction failed for session {}: {:#}", session_id, e);
            }
            debug!("Re-checking session {} after deferred triggers", session_id);
        }
    }

    async fn compact(&self, room_id: &str, session_id: &str) -> anyhow::Result<Option<CompactionReport>> {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, session_id) else {
            debug!("Compaction already in flight for session {}", session_id);
            return Ok(None);
        };
        let outcome = self.compact_guarded(room_id, session_id).await;
        drop(guard);

        if self.pending.remove(session_id).is_some() {
            if let Err(e) = self.check_threshold(room_id, session_id).await {
                warn!("Deferred summarization check failed for session {}: {:#}", session_id, e);
            }
        }
        outcome.map(Some)
    }

    async fn compact_guarded(&self, room_id: &str, session_id: &str) -> anyhow::Result<CompactionReport> {
        self.counters.compactions_started.fetch_add(1, Ordering::Relaxed);
        match self.run_compaction(room_id, session_id).await {
            Ok(report) => {
                self.counters.compactions_completed.fetch_add(1, Ordering::Relaxed);
                Ok(report)
            }
            Err(e) => {
                self.counters.compactions_failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn run_compaction(&self, room_id: &str, session_id: &str) -> anyhow::Result<CompactionReport> {
        let messages = self.store.get_messages(session_id, None).await?;
        let foldable = messages.len().saturating_sub(self.settings.keep_recent);
        let candidates: Vec<Message> = messages
            .into_iter()
            .take(foldable)
            .filter(|m| !m.compressed)
            .collect();

        if foldable < self.settings.min_messages || candidates.is_empty() {
            debug!(
                "Session {}: {} messages outside the recent window ({} uncompressed, minimum {}), nothing to fold",
                session_id,
                foldable,
                candidates.len(),
                self.settings.min_messages
            );
            return Ok(CompactionReport {
                session_id: session_id.to_string(),
                summary: None,
                compressed: 0,
                scenes: Vec::new(),
            });
        }

        info!("Compacting {} messages in session {}", candidates.len(), session_id);
        let draft = self.summarizer.summarize(&candidates).await?;
        let message_ids: Vec<i64> = candidates.iter().map(|m| m.id).collect();

        let summary = self
            .store
            .record_summary(NewSummary {
                session_id: session_id.to_string(),
                summary_type: SummaryType::Messages,
                token_count: TextUtils::estimate_tokens(&draft.text),
                title: draft.title,
                text: draft.text,
                message_ids: message_ids.clone(),
            })
            .await?;
        self.counters.summaries_created.fetch_add(1, Ordering::Relaxed);

        // The summary is durable; only now may its messages be marked.
        let compressed = self.store.mark_compressed(&message_ids).await?;
        info!(
            "Session {}: summary {} folded {} messages",
            session_id, summary.id, compressed
        );
        if compressed > 0 {
            if let Some(cache) = &self.cache {
                cache.invalidate_room(room_id);
            }
        }

        let scenes = match &self.scene_detector {
            Some(detector) => self.record_scenes(detector, session_id, &candidates).await,
            None => Vec::new(),
        };

        Ok(CompactionReport {
            session_id: session_id.to_string(),
            summary: Some(summary),
            compressed,
            scenes,
        })
    }

    /// Scene bookkeeping is best-effort; failures are logged and skipped.
    async fn record_scenes(&self, detector: &SceneDetector, session_id: &str, messages: &[Message]) -> Vec<Summary> {
        let mut recorded = Vec::new();
        for scene in detector.detect(session_id, messages) {
            let result = self
                .store
                .record_summary(NewSummary {
                    session_id: session_id.to_string(),
                    summary_type: SummaryType::Scene,
                    token_count: TextUtils::estimate_tokens(&scene.description),
                    title: scene.title.clone(),
                    text: scene.description.clone(),
                    message_ids: scene.message_ids.clone(),
                })
                .await;
            match result {
                Ok(summary) => {
                    self.counters.scenes_detected.fetch_add(1, Ordering::Relaxed);
                    info!(
                        "Session {}: scene \"{}\" over messages {}..{} (confidence {:.2})",
                        session_id, scene.title, scene.start_message_id, scene.end_message_id, scene.confidence
                    );
                    recorded.push(summary);
                }
                Err(e) => warn!("Failed to record scene {} for session {}: {:#}", scene.id, session_id, e),
            }
        }
        recorded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SceneDetectionConfig;
    use crate::memory::{InMemoryRecordStore, NewMessage};
    use std::collections::HashSet;

    async fn seeded(count: usize) -> (Arc<InMemoryRecordStore>, String) {
        let store = Arc::new(InMemoryRecordStore::default());
        let session = store.open_session("room").await.unwrap();
        for i in 0..count {
            store
                .append_message(&session.id, NewMessage::user(format!("line {i} about the dragon")))
                .await
                .unwrap();
        }
        (store, session.id)
    }

    fn scheduler(store: Arc<InMemoryRecordStore>, summarizer: Arc<dyn Summarizer>) -> SummarizationScheduler {
        SummarizationScheduler::new(store, summarizer, None, None, SchedulerSettings::default())
    }

    async fn assert_compressed_are_summarized(store: &InMemoryRecordStore, session_id: &str) {
        let covered: HashSet<i64> = store
            .get_summaries(session_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| s.summary_type == SummaryType::Messages)
            .flat_map(|s| s.message_ids)
            .collect();
        for message in store.get_messages(session_id, None).await.unwrap() {
            if message.compressed {
                assert!(covered.contains(&message.id), "message {} compressed without summary", message.id);
            }
        }
    }

    #[tokio::test]
    async fn extractive_summary_mentions_participants_and_lines() {
        let (store, session_id) = seeded(3).await;
        let messages = store.get_messages(&session_id, None).await.unwrap();
        let draft = ExtractiveSummarizer::default().summarize(&messages).await.unwrap();

        assert!(draft.title.starts_with("Messages"));
        assert!(draft.title.contains("dragon"));
        assert!(draft.text.contains("user"));
        assert!(draft.text.contains("line 0"));
        assert!(draft.text.contains("line 2"));
        assert!(ExtractiveSummarizer::default().summarize(&[]).await.is_err());
    }

    #[tokio::test]
    async fn below_threshold_does_nothing() {
        let (store, session_id) = seeded(99).await;
        let scheduler = scheduler(store.clone(), Arc::new(ExtractiveSummarizer::default()));

        scheduler.notify_message_written("room", &session_id);
        scheduler.wait_idle().await;

        assert!(store.get_summaries(&session_id).await.unwrap().is_empty());
        assert_eq!(scheduler.counters().compactions_started.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn threshold_folds_all_but_recent_tail() {
        let (store, session_id) = seeded(100).await;
        let scheduler = scheduler(store.clone(), Arc::new(ExtractiveSummarizer::default()));

        scheduler.notify_message_written("room", &session_id);
        scheduler.wait_idle().await;

        let summaries = store.get_summaries(&session_id).await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].message_ids.len(), 80);

        let messages = store.get_messages(&session_id, None).await.unwrap();
        assert!(messages[..80].iter().all(|m| m.compressed));
        assert!(messages[80..].iter().all(|m| !m.compressed));
        assert_compressed_are_summarized(&store, &session_id).await;
        assert!(!scheduler.is_in_flight(&session_id));
    }

    #[tokio::test]
    async fn small_remainder_is_left_alone() {
        let (store, session_id) = seeded(25).await;
        let scheduler = scheduler(store.clone(), Arc::new(ExtractiveSummarizer::default()));

        let report = scheduler.compact_now("room", &session_id).await.unwrap().unwrap();
        assert!(report.summary.is_none());
        assert_eq!(report.compressed, 0);
        assert!(store.get_summaries(&session_id).await.unwrap().is_empty());
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> anyhow::Result<SummaryDraft> {
            Err(anyhow::anyhow!("model unavailable"))
        }
    }

    #[tokio::test]
    async fn failure_leaves_messages_untouched_and_clears_in_flight() {
        let (store, session_id) = seeded(100).await;
        let scheduler = scheduler(store.clone(), Arc::new(FailingSummarizer));

        scheduler.notify_message_written("room", &session_id);
        scheduler.wait_idle().await;

        assert!(!scheduler.is_in_flight(&session_id));
        assert_eq!(scheduler.counters().compactions_failed.load(Ordering::Relaxed), 1);
        assert!(store.get_summaries(&session_id).await.unwrap().is_empty());
        let messages = store.get_messages(&session_id, None).await.unwrap();
        assert!(messages.iter().all(|m| !m.compressed));
    }

    struct PanickingSummarizer;

    #[async_trait]
    impl Summarizer for PanickingSummarizer {
        async fn summarize(&self, _messages: &[Message]) -> anyhow::Result<SummaryDraft> {
            panic!("summarizer bug");
        }
    }

    #[tokio::test]
    async fn panic_still_clears_in_flight_and_idles() {
        let (store, session_id) = seeded(100).await;
        let scheduler = scheduler(store, Arc::new(PanickingSummarizer));

        scheduler.notify_message_written("room", &session_id);
        scheduler.wait_idle().await;
        assert!(!scheduler.is_in_flight(&session_id));
    }

    #[derive(Default)]
    struct GatedSummarizer {
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Summarizer for GatedSummarizer {
        async fn summarize(&self, messages: &[Message]) -> anyhow::Result<SummaryDraft> {
            self.started.notify_one();
            self.release.notified().await;
            ExtractiveSummarizer::default().summarize(messages).await
        }
    }

    #[tokio::test]
    async fn second_trigger_while_in_flight_is_a_no_op() {
        let (store, session_id) = seeded(30).await;
        let gate = Arc::new(GatedSummarizer::default());
        let scheduler = scheduler(store.clone(), gate.clone());

        let background = {
            let scheduler = scheduler.clone();
            let session_id = session_id.clone();
            tokio::spawn(async move { scheduler.compact_now("room", &session_id).await })
        };

        gate.started.notified().await;
        assert!(scheduler.is_in_flight(&session_id));
        assert!(scheduler.compact_now("room", &session_id).await.unwrap().is_none());

        gate.release.notify_one();
        let report = background.await.unwrap().unwrap().unwrap();
        assert_eq!(report.compressed, 10);
        assert!(!scheduler.is_in_flight(&session_id));
        assert_eq!(store.get_summaries(&session_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trigger_during_compaction_is_rechecked_on_release() {
        let (store, session_id) = seeded(100).await;
        let gate = Arc::new(GatedSummarizer::default());
        let scheduler = scheduler(store.clone(), gate.clone());

        scheduler.notify_message_written("room", &session_id);
        gate.started.notified().await;

        for i in 0..30 {
            store
                .append_message(&session_id, NewMessage::user(format!("late line {i}")))
                .await
                .unwrap();
        }
        scheduler.notify_message_written("room", &session_id);
        while !scheduler.inner.pending.contains(&session_id) {
            tokio::task::yield_now().await;
        }

        gate.release.notify_one();
        gate.started.notified().await;
        gate.release.notify_one();
        scheduler.wait_idle().await;

        let messages = store.get_messages(&session_id, None).await.unwrap();
        assert!(messages[..110].iter().all(|m| m.compressed));
        assert!(messages[110..].iter().all(|m| !m.compressed));
        assert_eq!(store.get_summaries(&session_id).await.unwrap().len(), 2);
        assert!(scheduler.inner.pending.is_empty());
        assert_compressed_are_summarized(&store, &session_id).await;
    }

    #[tokio::test]
    async fn single_stray_message_past_threshold_is_folded() {
        let (store, session_id) = seeded(100).await;
        let scheduler = scheduler(store.clone(), Arc::new(ExtractiveSummarizer::default()));
        scheduler.compact_now("room", &session_id).await.unwrap().unwrap();

        store
            .append_message(&session_id, NewMessage::user("one more line"))
            .await
            .unwrap();
        let report = scheduler.compact_now("room", &session_id).await.unwrap().unwrap();
        assert_eq!(report.compressed, 1);

        let report = scheduler.compact_now("room", &session_id).await.unwrap().unwrap();
        assert!(report.summary.is_none());
    }

    #[tokio::test]
    async fn compacted_range_is_scanned_for_scenes() {
        let store = Arc::new(InMemoryRecordStore::default());
        let session = store.open_session("room").await.unwrap();
        let lines = [
            ("Aria", "I attack the ogre"),
            ("Bram", "I swing my hammer"),
            ("Cato", "I cast a spell and strike"),
            ("Aria", "We find a chest of gold"),
            ("Bram", "Split the treasure"),
        ];
        for (speaker, text) in lines.iter().cycle().take(30) {
            store
                .append_message(&session.id, NewMessage::user(*text).with_speaker(*speaker))
                .await
                .unwrap();
        }

        let detector = Arc::new(SceneDetector::with_keyword_analyzer(SceneDetectionConfig::default()));
        let scheduler = SummarizationScheduler::new(
            store.clone(),
            Arc::new(ExtractiveSummarizer::default()),
            Some(detector),
            None,
            SchedulerSettings::default(),
        );

        let report = scheduler.compact_now("room", &session.id).await.unwrap().unwrap();
        assert_eq!(report.compressed, 10);
        assert_eq!(report.scenes.len(), 1);
        assert_eq!(report.scenes[0].summary_type, SummaryType::Scene);
        assert_eq!(report.scenes[0].message_ids.len(), 10);
        assert_eq!(scheduler.counters().scenes_detected.load(Ordering::Relaxed), 1);
        assert_compressed_are_summarized(&store, &session.id).await;
    }
}
