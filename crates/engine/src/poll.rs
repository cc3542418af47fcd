//! Adaptive polling of remote executions.

use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use pollux_core::{ExecutionHandle, ExecutionId};
use pollux_resilience::{FailureKind, RemoteFailure, ResilienceError};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::with_timeout;
use crate::error::EngineError;
use crate::orchestrator::EngineCore;

/// Interval schedule for polling one execution.
///
/// A pure function of the tick number: intervals are non-decreasing, never
/// below the floor, never above the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollStrategy {
    /// The same interval between every pair of ticks.
    Fixed {
        /// Interval between ticks.
        interval: Duration,
    },
    /// Interval grows geometrically from the floor up to the ceiling, so a
    /// long-running execution is polled less and less aggressively.
    Adaptive {
        /// First and smallest interval.
        floor: Duration,
        /// Largest interval the schedule ever reaches.
        ceiling: Duration,
        /// Multiplier applied per tick (>= 1.0).
        growth: f64,
    },
}

impl Default for PollStrategy {
    fn default() -> Self {
        Self::Adaptive {
            floor: Duration::from_millis(500),
            ceiling: Duration::from_secs(10),
            growth: 1.5,
        }
    }
}

impl PollStrategy {
    /// A fixed-interval schedule.
    #[must_use]
    pub fn fixed(interval: Duration) -> Self {
        Self::Fixed { interval }
    }

    /// A geometrically growing schedule clamped to `[floor, ceiling]`.
    #[must_use]
    pub fn adaptive(floor: Duration, ceiling: Duration, growth: f64) -> Self {
        Self::Adaptive {
            floor,
            ceiling,
            growth,
        }
    }

    /// Validate the schedule's parameters.
    pub fn validate(&self) -> Result<(), EngineError> {
        match *self {
            Self::Fixed { interval } => {
                if interval.is_zero() {
                    return Err(EngineError::invalid_config(
                        "poll interval must be greater than 0",
                    ));
                }
            }
            Self::Adaptive {
                floor,
                ceiling,
                growth,
            } => {
                if floor.is_zero() {
                    return Err(EngineError::invalid_config(
                        "poll floor must be greater than 0",
                    ));
                }
                if ceiling < floor {
                    return Err(EngineError::invalid_config(
                        "poll ceiling must be >= floor",
                    ));
                }
                if !growth.is_finite() || growth < 1.0 {
                    return Err(EngineError::invalid_config(
                        "poll growth must be a finite value >= 1.0",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Interval to wait after the tick with the given zero-based index.
    #[must_use]
    pub fn delay_for(&self, tick: u32) -> Duration {
        match *self {
            Self::Fixed { interval } => interval,
            Self::Adaptive {
                floor,
                ceiling,
                growth,
            } => {
                let exponent = i32::try_from(tick).unwrap_or(i32::MAX);
                let scaled = floor.as_secs_f64() * growth.powi(exponent);
                if !scaled.is_finite() || scaled >= ceiling.as_secs_f64() {
                    ceiling
                } else {
                    Duration::from_secs_f64(scaled).clamp(floor, ceiling)
                }
            }
        }
    }
}

struct PollState {
    core: Arc<EngineCore>,
    id: ExecutionId,
    ticks: u32,
    last_fingerprint: Option<u64>,
    done: bool,
}

impl EngineCore {
    /// One poll tick: cache-first, else a breaker-wrapped fetch written back
    /// through the cache.
    pub(crate) async fn fetch_snapshot(
        &self,
        id: ExecutionId,
    ) -> Result<ExecutionHandle, ResilienceError> {
        let result = self
            .cache
            .get_or_fetch(id, || {
                let client = Arc::clone(&self.client);
                let breaker = Arc::clone(&self.breaker);
                let retry = self.retry;
                let limit = self.call_timeout;
                async move {
                    breaker
                        .execute_with_retry(
                            || {
                                let client = Arc::clone(&client);
                                async move { with_timeout(limit, client.fetch(id)).await }
                            },
                            &retry,
                        )
                        .await
                }
            })
            .await;

        match result {
            Ok(handle) => Ok(handle),
            Err(pollux_cache::CacheError::Fetch(err)) => Err(err),
            Err(pollux_cache::CacheError::Corrupted { .. }) => {
                Err(ResilienceError::Remote(RemoteFailure::new(
                    FailureKind::Client,
                    "fetched snapshot did not match the requested execution",
                )))
            }
        }
    }

    /// Lazy stream of observed snapshots for one execution.
    ///
    /// Emission is distinct-until-changed on the snapshot fingerprint; a
    /// terminal snapshot is emitted once and ends the stream, as does an
    /// unrecoverable fetch error. No task is spawned: dropping the stream
    /// cancels the schedule synchronously.
    pub(crate) fn watch_stream(
        self: &Arc<Self>,
        id: ExecutionId,
    ) -> impl Stream<Item = Result<ExecutionHandle, ResilienceError>> + Send + 'static {
        let state = PollState {
            core: Arc::clone(self),
            id,
            ticks: 0,
            last_fingerprint: None,
            done: false,
        };
        futures::stream::unfold(state, |mut state| async move {
            loop {
                if state.done {
                    return None;
                }
                if state.ticks > 0 {
                    let delay = state.core.strategy.delay_for(state.ticks - 1);
                    tokio::time::sleep(delay).await;
                }
                state.ticks += 1;

                match state.core.fetch_snapshot(state.id).await {
                    Ok(handle) => {
                        let fingerprint = handle.fingerprint();
                        if handle.is_terminal() {
                            debug!(id = %state.id, status = %handle.status, "execution settled");
                            state.done = true;
                            return Some((Ok(handle), state));
                        }
                        if state.last_fingerprint != Some(fingerprint) {
                            state.last_fingerprint = Some(fingerprint);
                            return Some((Ok(handle), state));
                        }
                        // Unchanged snapshot: keep ticking, emit nothing.
                    }
                    Err(err) => {
                        debug!(id = %state.id, %err, "polling ended on unrecoverable error");
                        state.done = true;
                        return Some((Err(err), state));
                    }
                }
            }
        })
    }

    /// Poll until the execution settles, honoring `cancel`.
    ///
    /// On cancellation a best-effort remote cancel is issued before
    /// returning [`ResilienceError::Cancelled`].
    pub(crate) async fn await_terminal(
        self: &Arc<Self>,
        id: ExecutionId,
        cancel: &CancellationToken,
    ) -> Result<ExecutionHandle, ResilienceError> {
        let stream = self.watch_stream(id);
        futures::pin_mut!(stream);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancel_remote_best_effort(id).await;
                    return Err(ResilienceError::Cancelled);
                }
                next = stream.next() => match next {
                    Some(Ok(handle)) if handle.is_terminal() => return Ok(handle),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err),
                    // The stream only ends after a terminal emit or an error.
                    None => return Err(ResilienceError::Cancelled),
                },
            }
        }
    }

    /// Ask the remote service to cancel, ignoring failures.
    pub(crate) async fn cancel_remote_best_effort(&self, id: ExecutionId) {
        if let Err(err) = with_timeout(self.call_timeout, self.client.cancel(id)).await {
            debug!(%id, %err, "remote cancel failed, ignoring");
        }
    }
}
