//! Unified error surface for the orchestrator facade.

use pollux_cache::CacheError;
use pollux_queue::QueueError;
use pollux_resilience::ResilienceError;
use thiserror::Error;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A breaker-wrapped remote call failed.
    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    /// A cache operation failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },
}

impl EngineError {
    /// Shorthand for an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
