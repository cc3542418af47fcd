//! Remote execution status tracking.

use serde::{Deserialize, Serialize};

/// The last observed status of a remote execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Accepted by the remote service but not yet started.
    Pending,
    /// Actively running on the remote service.
    Running,
    /// Suspended, waiting for external input (e.g. a resume call).
    Waiting,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failed,
    /// Cancelled before reaching a result.
    Canceled,
    /// The remote service reported a status this client does not recognize.
    Unknown,
}

impl ExecutionStatus {
    /// Returns `true` if the execution has reached a final state.
    ///
    /// `Unknown` is deliberately non-terminal: an unrecognized status must
    /// keep the poller alive rather than silently ending the watch.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Returns `true` if the execution is still in flight.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Waiting)
    }

    /// Returns `true` if the execution completed successfully.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns `true` if the execution ended in a failure state.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Terminality rank used to enforce forward-only status observation.
    ///
    /// Active statuses rank 0, terminal statuses rank 1. A snapshot may
    /// never replace one with a higher rank — a stale in-flight fetch that
    /// completes after a terminal status was recorded is discarded.
    #[must_use]
    pub fn rank(&self) -> u8 {
        u8::from(self.is_terminal())
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Canceled.is_terminal());

        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Waiting.is_terminal());
        assert!(!ExecutionStatus::Unknown.is_terminal());
    }

    #[test]
    fn active_states() {
        assert!(ExecutionStatus::Pending.is_active());
        assert!(ExecutionStatus::Running.is_active());
        assert!(ExecutionStatus::Waiting.is_active());

        assert!(!ExecutionStatus::Success.is_active());
        assert!(!ExecutionStatus::Unknown.is_active());
    }

    #[test]
    fn success_and_failure() {
        assert!(ExecutionStatus::Success.is_success());
        assert!(!ExecutionStatus::Failed.is_success());
        assert!(ExecutionStatus::Failed.is_failure());
        assert!(!ExecutionStatus::Canceled.is_failure());
    }

    #[test]
    fn rank_orders_terminality() {
        assert!(ExecutionStatus::Running.rank() < ExecutionStatus::Success.rank());
        assert!(ExecutionStatus::Waiting.rank() < ExecutionStatus::Canceled.rank());
        assert_eq!(
            ExecutionStatus::Failed.rank(),
            ExecutionStatus::Success.rank()
        );
    }

    #[test]
    fn display_formatting() {
        assert_eq!(ExecutionStatus::Pending.to_string(), "pending");
        assert_eq!(ExecutionStatus::Canceled.to_string(), "canceled");
        assert_eq!(ExecutionStatus::Unknown.to_string(), "unknown");
    }

    #[test]
    fn serde_rename_snake_case() {
        let json = serde_json::to_string(&ExecutionStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
    }

    #[test]
    fn serde_roundtrip() {
        let statuses = [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Waiting,
            ExecutionStatus::Success,
            ExecutionStatus::Failed,
            ExecutionStatus::Canceled,
            ExecutionStatus::Unknown,
        ];
        for status in &statuses {
            let json = serde_json::to_string(status).unwrap();
            let back: ExecutionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(*status, back, "roundtrip failed for {status}");
        }
    }
}
