#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pollux Engine
//!
//! Orchestration layer for long-running remote executions.
//!
//! The [`Orchestrator`] facade owns a circuit breaker, a snapshot cache, a
//! priority queue, and a [`RemoteExecutionClient`], and exposes:
//!
//! - **Queue-driven starts** — [`Orchestrator::enqueue_execution`] admits a
//!   start request; the item settles when the execution reaches a terminal
//!   status
//! - **Adaptive polling** — [`Orchestrator::watch_execution`] yields a lazy,
//!   distinct-until-changed stream of snapshots that consults the cache
//!   before every fetch and stops at the terminal status
//! - **Composition** — [`Orchestrator::start_parallel`],
//!   [`Orchestrator::start_sequential`], [`Orchestrator::start_race`], and
//!   [`Orchestrator::start_batch`], all cancellation-aware and built only on
//!   the components above
//!
//! Every remote call is bounded by a configurable timeout (classified as a
//! transient failure on expiry) and wrapped in the shared breaker.

pub mod client;
pub mod compose;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod poll;

pub use client::RemoteExecutionClient;
pub use compose::{ChildResult, FailureMode, OnFailure};
pub use config::OrchestratorConfig;
pub use error::EngineError;
pub use orchestrator::{Orchestrator, OrchestratorMetrics};
pub use poll::PollStrategy;

pub use pollux_core::{ExecutionHandle, ExecutionId, ExecutionStatus};
