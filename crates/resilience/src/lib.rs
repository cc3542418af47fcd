#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Pollux Resilience
//!
//! Failure classification, retry, and circuit breaking for remote calls.
//!
//! Every remote operation the orchestration layer performs — start, status
//! fetch, resume, cancel — goes through a [`CircuitBreaker`], which counts
//! consecutive transient failures, fails fast while open, and admits a
//! single probe while half-open. Retry is a separate, composable loop
//! ([`CircuitBreaker::execute_with_retry`]) driven by a pure
//! [`RetryPolicy`].
//!
//! The taxonomy is deliberately small:
//!
//! - [`RemoteFailure`] — a failure reported by (or on the way to) the
//!   remote service, classified transient or permanent by [`FailureKind`]
//! - [`ResilienceError`] — what callers actually receive: the remote
//!   failure itself, a synthetic [`ResilienceError::CircuitOpen`], or
//!   [`ResilienceError::RetriesExhausted`] wrapping the last transient cause

pub mod circuit_breaker;
pub mod error;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use error::{FailureKind, RemoteFailure, ResilienceError};
pub use retry::{Backoff, RetryPolicy};

/// Result type for breaker-wrapped operations.
pub type ResilienceResult<T> = Result<T, ResilienceError>;
