//! Queue counters.

use serde::{Deserialize, Serialize};

/// Aggregate view of item states, computed from live records at query time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Items admitted but not yet dispatched.
    pub pending: usize,
    /// Items currently running.
    pub processing: usize,
    /// Items that completed successfully.
    pub completed: usize,
    /// Items that failed or were abandoned.
    pub failed: usize,
}

impl QueueMetrics {
    /// Fraction of terminal items that completed successfully, in
    /// `[0.0, 1.0]`. Returns 0.0 before any item has finished.
    #[must_use]
    pub fn completion_rate(&self) -> f64 {
        let terminal = self.completed + self.failed;
        if terminal == 0 {
            0.0
        } else {
            self.completed as f64 / terminal as f64
        }
    }

    /// Total number of tracked items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed
    }
}
