//! Execution snapshots.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::ExecutionId;
use crate::status::ExecutionStatus;

/// The last known snapshot of a tracked remote execution.
///
/// Handles are immutable value objects: the poller and cache replace whole
/// snapshots rather than mutating fields in place, so a reader always sees
/// an internally consistent `(status, payload)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionHandle {
    /// Identifier assigned by the remote service at start time.
    pub id: ExecutionId,
    /// Last observed status.
    pub status: ExecutionStatus,
    /// When the start call succeeded.
    pub started_at: DateTime<Utc>,
    /// When a terminal status was first observed, if any.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last payload reported by the remote service.
    pub last_payload: serde_json::Value,
    /// Terminal error description, if the execution failed.
    pub error: Option<String>,
}

impl ExecutionHandle {
    /// Create the initial snapshot for a freshly started execution.
    #[must_use]
    pub fn started(id: ExecutionId) -> Self {
        Self {
            id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            finished_at: None,
            last_payload: serde_json::Value::Null,
            error: None,
        }
    }

    /// Build the successor snapshot for a newly observed update.
    ///
    /// Carries `started_at` forward and stamps `finished_at` on the first
    /// transition into a terminal status.
    #[must_use]
    pub fn observed(
        &self,
        status: ExecutionStatus,
        payload: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        let finished_at = match self.finished_at {
            Some(at) => Some(at),
            None if status.is_terminal() => Some(Utc::now()),
            None => None,
        };
        Self {
            id: self.id,
            status,
            started_at: self.started_at,
            finished_at,
            last_payload: payload,
            error,
        }
    }

    /// Returns `true` if this snapshot carries a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Stable fingerprint over status and payload.
    ///
    /// The poller suppresses consecutive emissions with equal fingerprints:
    /// a repeated `Running` with an unchanged payload is noise, but a
    /// `Running` whose payload advanced is a real update.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.status.hash(&mut hasher);
        // serde_json::Value does not implement Hash; its canonical string
        // rendering is stable for a given value.
        self.last_payload.to_string().hash(&mut hasher);
        self.error.hash(&mut hasher);
        hasher.finish()
    }
}
