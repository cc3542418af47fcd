//! Failure taxonomy for remote operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a remote failure.
///
/// Transient kinds may succeed on retry; permanent kinds will not and are
/// never retried or counted against the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The call exceeded its caller-specified timeout.
    Timeout,
    /// The connection could not be established or was dropped.
    Connection,
    /// The remote service answered with a server-side error.
    Server,
    /// The remote service asked the client to back off.
    RateLimited,
    /// The request was rejected as invalid.
    Validation,
    /// The referenced entity does not exist.
    NotFound,
    /// Any other client-side rejection.
    Client,
}

impl FailureKind {
    /// Returns `true` if a retry of the same call could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Connection | Self::Server | Self::RateLimited
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Connection => write!(f, "connection"),
            Self::Server => write!(f, "server"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::Validation => write!(f, "validation"),
            Self::NotFound => write!(f, "not_found"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// A failure reported by a remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind} failure: {message}")]
pub struct RemoteFailure {
    /// Classification driving retry and circuit decisions.
    pub kind: FailureKind,
    /// Human-readable description from the transport or service.
    pub message: String,
    /// Back-off hint supplied by the service, if any.
    pub retry_after: Option<Duration>,
}

impl RemoteFailure {
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a timeout failure for a call that exceeded `limit`.
    #[must_use]
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            FailureKind::Timeout,
            format!("call exceeded timeout of {limit:?}"),
        )
    }

    /// Attach a back-off hint.
    #[must_use]
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Returns `true` if this failure is retry-eligible.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Errors surfaced by breaker-wrapped operations.
///
/// `Clone` is load-bearing: coalesced cache waiters all receive the same
/// failure, and the retry loop keeps the last transient cause around.
/// Serde support lets queue item records carry the structured cause.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResilienceError {
    /// The remote call itself failed.
    #[error(transparent)]
    Remote(#[from] RemoteFailure),

    /// The circuit is open; the wrapped operation was never invoked.
    #[error("circuit open{}", retry_after.map(|d| format!(" (retry after {d:?})")).unwrap_or_default())]
    CircuitOpen {
        /// Remaining cooldown before a probe will be admitted.
        retry_after: Option<Duration>,
    },

    /// All retry attempts were exhausted on transient failures.
    #[error("retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The transient failure observed on the final attempt.
        #[source]
        last: RemoteFailure,
    },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// A configuration value failed validation.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What was wrong.
        message: String,
    },
}

impl ResilienceError {
    /// Shorthand for an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Returns `true` if retrying the underlying call could succeed.
    ///
    /// Only the raw transient remote failure qualifies — `CircuitOpen` and
    /// `RetriesExhausted` are final as far as a single retry loop is
    /// concerned.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Remote(f) if f.is_transient())
    }

    /// Back-off hint, if the failure carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote(f) => f.retry_after,
            Self::CircuitOpen { retry_after } => *retry_after,
            _ => None,
        }
    }
}
