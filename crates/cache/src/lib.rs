#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pollux Cache
//!
//! In-memory TTL cache for the last known snapshot of each tracked
//! execution.
//!
//! The cache is the single owner of [`ExecutionHandle`](pollux_core::ExecutionHandle)
//! snapshots. Beyond plain `get`/`set` it provides:
//!
//! - **Request coalescing** — concurrent [`ExecutionCache::get_or_fetch`]
//!   calls for the same missing or expired key share one underlying fetch
//! - **Watch streams** — [`ExecutionCache::watch`] emits on every `set` and
//!   completes when the key is invalidated
//! - **Reactive metrics** — hit/miss/set/invalidation counters republished
//!   through a `tokio::sync::watch` channel so observers never poll
//! - **Monotonic writes** — a less-terminal status never overwrites a
//!   terminal snapshot

pub mod cache;
pub mod error;
pub mod metrics;
pub mod watch;

pub use cache::{CacheConfig, ExecutionCache};
pub use error::CacheError;
pub use metrics::CacheMetrics;
pub use watch::WatchStream;
