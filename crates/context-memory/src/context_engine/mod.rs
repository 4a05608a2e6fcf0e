//! Context engine module - scoring, budgeting, caching and compaction behind the `ContextMemory` facade

pub mod budget_allocator;
pub mod context_cache;
pub mod entity_extractor;
pub mod orchestrator;
pub mod priority_scorer;
pub mod scene_detector;
pub mod summarization;

pub use budget_allocator::{BudgetAllocator, OptimizedContext};
pub use context_cache::{CacheKey, CacheOutcome, ContextCache};
pub use entity_extractor::{EntityExtractor, ExtractedEntity, PatternEntityExtractor};
pub use orchestrator::{ContextMemory, ContextMemoryBuilder, EngineStats};
pub use priority_scorer::{
    EntitySignals, EntityWeights, MessageWeights, PrioritizedEntity, PrioritizedMessage, PriorityScorer,
};
pub use scene_detector::{KeywordSceneAnalyzer, SceneAnalysis, SceneAnalyzer, SceneDetector};
pub use summarization::{
    CompactionReport, ExtractiveSummarizer, SchedulerCounters, SchedulerSettings, SummarizationScheduler,
    Summarizer, SummaryDraft,
};
