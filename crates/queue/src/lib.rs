#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pollux Queue
//!
//! Priority queue for admitting and dispatching remote start requests.
//!
//! Admitted items are dispatched highest-priority first (FIFO within a
//! priority) into a [`QueueExecutor`], bounded by a concurrency limit and an
//! optional minimum inter-dispatch interval. Each item moves through a
//! monotonic state machine (`Pending → Processing → {Completed | Failed}`)
//! observable through the [`QueueTicket`] returned at admission.
//!
//! Terminal items are retained up to a configurable count/age horizon.
//! Shutdown comes in two modes: graceful (drain in-flight work, stop
//! admitting) and forced (cancel in-flight work, abandon pending items);
//! neither deadlocks and both are idempotent.

pub mod error;
pub mod item;
pub mod metrics;
pub mod queue;

pub use error::QueueError;
pub use item::{QueueItem, QueueItemState};
pub use metrics::QueueMetrics;
pub use queue::{
    ExecutionQueue, QueueConfig, QueueExecutor, QueueTicket, RetentionPolicy,
};
