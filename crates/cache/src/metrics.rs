//! Cache counters.

use serde::{Deserialize, Serialize};

/// Cache activity counters.
///
/// Maintained inside a `tokio::sync::watch` channel: every change is
/// republished to subscribers of
/// [`ExecutionCache::metrics_watch`](crate::ExecutionCache::metrics_watch),
/// so observers see updated values without polling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetrics {
    /// Reads answered from a fresh entry.
    pub hits: u64,
    /// Reads that found no fresh entry.
    pub misses: u64,
    /// Snapshots stored.
    pub sets: u64,
    /// Entries removed by explicit invalidation.
    pub invalidations: u64,
    /// Entries removed by TTL sweep or capacity pressure.
    pub evictions: u64,
}

impl CacheMetrics {
    /// Fraction of reads answered from cache, in `[0.0, 1.0]`.
    ///
    /// Returns 0.0 before any read has happened.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_zero_without_reads() {
        assert!(CacheMetrics::default().hit_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn hit_rate_ratio() {
        let metrics = CacheMetrics {
            hits: 3,
            misses: 1,
            ..CacheMetrics::default()
        };
        assert!((metrics.hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
