//! Queue item records and their state machine.

use chrono::{DateTime, Utc};
use pollux_core::QueueItemId;
use pollux_resilience::ResilienceError;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a queued item.
///
/// Transitions are monotonic: `Pending → Processing → {Completed | Failed}`.
/// The one shortcut is `Pending → Failed`, taken when a forced shutdown
/// abandons items that were never dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    /// Admitted, waiting for a processing slot.
    Pending,
    /// Dispatched; the execution function is running.
    Processing,
    /// The execution function returned successfully.
    Completed,
    /// The execution function failed, or the item was abandoned.
    Failed,
}

impl QueueItemState {
    /// Returns `true` for `Completed` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns `true` if moving to `next` is a legal forward transition.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Failed)
                | (Self::Processing, Self::Completed | Self::Failed)
        )
    }
}

impl std::fmt::Display for QueueItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One admitted start request and its progress through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Unique item identifier.
    pub id: QueueItemId,
    /// Opaque request payload handed to the execution function.
    pub payload: serde_json::Value,
    /// Dispatch priority; higher dispatches first.
    pub priority: u8,
    /// Current lifecycle state.
    pub state: QueueItemState,
    /// When the item was admitted.
    pub enqueued_at: DateTime<Utc>,
    /// When the item was dispatched, if it has been.
    pub started_at: Option<DateTime<Utc>>,
    /// When the item reached a terminal state, if it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// Cause of failure for `Failed` items.
    pub error: Option<ResilienceError>,
}

impl QueueItem {
    /// Create a freshly admitted item.
    #[must_use]
    pub fn new(id: QueueItemId, payload: serde_json::Value, priority: u8) -> Self {
        Self {
            id,
            payload,
            priority,
            state: QueueItemState::Pending,
            enqueued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Apply a state transition, stamping the relevant timestamp.
    ///
    /// Illegal transitions (backwards, or out of a terminal state) are
    /// ignored and return `false`.
    pub(crate) fn transition(&mut self, next: QueueItemState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        match next {
            QueueItemState::Processing => self.started_at = Some(Utc::now()),
            QueueItemState::Completed | QueueItemState::Failed => {
                self.completed_at = Some(Utc::now());
            }
            QueueItemState::Pending => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollux_resilience::{FailureKind, RemoteFailure};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn item() -> QueueItem {
        QueueItem::new(QueueItemId::v4(), json!({"job": "export"}), 3)
    }

    #[test]
    fn happy_path_transitions() {
        let mut item = item();
        assert_eq!(item.state, QueueItemState::Pending);
        assert!(item.transition(QueueItemState::Processing));
        assert!(item.started_at.is_some());
        assert!(item.transition(QueueItemState::Completed));
        assert!(item.completed_at.is_some());
        assert!(item.state.is_terminal());
    }

    #[test]
    fn terminal_states_are_frozen() {
        let mut item = item();
        item.transition(QueueItemState::Processing);
        item.transition(QueueItemState::Failed);
        assert!(!item.transition(QueueItemState::Processing));
        assert!(!item.transition(QueueItemState::Completed));
        assert_eq!(item.state, QueueItemState::Failed);
    }

    #[test]
    fn pending_may_be_abandoned_directly() {
        let mut item = item();
        assert!(item.transition(QueueItemState::Failed));
        assert!(item.started_at.is_none());
        assert!(item.completed_at.is_some());
    }

    #[test]
    fn backwards_transition_is_rejected() {
        let mut item = item();
        item.transition(QueueItemState::Processing);
        assert!(!item.state.can_transition_to(QueueItemState::Pending));
    }

    #[test]
    fn item_serde_roundtrip() {
        let mut original = item();
        original.transition(QueueItemState::Processing);
        original.error = Some(ResilienceError::from(RemoteFailure::new(
            FailureKind::Connection,
            "refused",
        )));
        let json = serde_json::to_string(&original).unwrap();
        let back: QueueItem = serde_json::from_str(&json).unwrap();
        assert_eq!(original, back);
    }
}
