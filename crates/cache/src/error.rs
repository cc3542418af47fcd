//! Cache error types.

use pollux_core::ExecutionId;
use pollux_resilience::ResilienceError;
use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// `Clone` is required so every coalesced waiter for one fetch receives the
/// same failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A cached or freshly fetched snapshot failed integrity validation.
    ///
    /// The offending entry is invalidated rather than served; callers may
    /// simply retry.
    #[error("corrupted cache entry for execution {key}")]
    Corrupted {
        /// Key whose entry was malformed.
        key: ExecutionId,
    },

    /// The underlying fetch failed.
    #[error(transparent)]
    Fetch(#[from] ResilienceError),
}
