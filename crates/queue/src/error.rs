//! Queue error types.

use pollux_core::QueueItemId;
use pollux_resilience::ResilienceError;
use thiserror::Error;

/// Errors surfaced by queue operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue no longer admits new items.
    #[error("queue is shutting down")]
    ShuttingDown,

    /// No item with the given id is tracked (never existed, or purged by
    /// retention before a terminal snapshot was observed).
    #[error("queue item {id} not found")]
    ItemNotFound {
        /// The missing item.
        id: QueueItemId,
    },

    /// The execution function failed for this item.
    #[error(transparent)]
    Execution(#[from] ResilienceError),

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_not_found_names_the_id() {
        let id = QueueItemId::v4();
        let err = QueueError::ItemNotFound { id };
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn execution_is_transparent() {
        let err = QueueError::from(ResilienceError::Cancelled);
        assert_eq!(err.to_string(), "operation cancelled");
    }
}
