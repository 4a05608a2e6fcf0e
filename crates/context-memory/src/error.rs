//! Error taxonomy for the context memory engine
//!
//! Caller errors and store errors surface from the facade; degradable
//! failures (cache, summarization, scene detection, extraction) are logged
//! and never reach this type.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A context cannot be built or written without an open session.
    #[error("no open session for room {room_id}")]
    NoOpenSession { room_id: String },

    #[error("invalid context options: {0}")]
    InvalidOptions(String),

    /// Propagated unchanged from the record store.
    #[error(transparent)]
    Store(#[from] anyhow::Error),

    #[error("context build timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// True for errors caused by the caller's input rather than the system.
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::NoOpenSession { .. } | Self::InvalidOptions(_))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
