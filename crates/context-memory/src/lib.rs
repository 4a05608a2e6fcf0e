// context-memory/crates/context-memory/src/lib.rs

pub mod config;
pub mod context_engine;
pub mod error;
pub mod memory;
pub mod memory_db;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use config::{ContextOptions, EngineConfig, SceneDetectionConfig, ScoringConfig};
pub use context_engine::{
    CompactionReport, ContextMemory, ContextMemoryBuilder, EngineStats, EntityExtractor, ExtractedEntity,
    ExtractiveSummarizer, KeywordSceneAnalyzer, OptimizedContext, PatternEntityExtractor, PrioritizedEntity,
    PrioritizedMessage, SceneAnalysis, SceneAnalyzer, Summarizer, SummaryDraft,
};
pub use error::{EngineError, EngineResult};
pub use memory::{
    AutoScene, Entity, EntityType, Fact, InMemoryRecordStore, Message, NewEntity, NewFact, NewMessage,
    NewSummary, RecordStore, Role, Session, Summary, SummaryType,
};
pub use memory_db::MemoryDatabase;
pub use telemetry::init_tracing;
