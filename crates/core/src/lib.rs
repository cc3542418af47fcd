#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pollux Core
//!
//! Fundamental types for the Pollux orchestration layer.
//!
//! This crate models the client-side view of a remote execution — it contains
//! no orchestration logic. It defines:
//!
//! - [`ExecutionId`] / [`QueueItemId`] — strongly-typed identifiers
//! - [`ExecutionStatus`] — remote execution state machine (7 states)
//! - [`ExecutionHandle`] — last known snapshot of a tracked execution

pub mod handle;
pub mod id;
pub mod status;

pub use handle::ExecutionHandle;
pub use id::{ExecutionId, QueueItemId};
pub use status::ExecutionStatus;
