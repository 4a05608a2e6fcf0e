//! Utilities module - Common utility functions for text processing and topic extraction

pub mod text_utils;
pub mod topic_extractor;

pub use text_utils::TextUtils;
pub use topic_extractor::TopicExtractor;
