//! Circuit breaker for remote operations.
//!
//! One breaker instance guards one logical remote-operation class and is
//! shared by reference (`Arc`) across every call site using it — never a
//! hidden global. Only transient failures count toward opening the circuit;
//! permanent failures pass straight through without touching breaker state.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
// Respects tokio's paused test clock, unlike the std counterpart.
use tokio::time::Instant;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RemoteFailure, ResilienceError};
use crate::retry::RetryPolicy;

/// Circuit breaker phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Operations are allowed.
    Closed,
    /// Operations fail fast until the cooldown elapses.
    Open,
    /// A single probe is allowed to test recovery.
    HalfOpen,
}

impl CircuitState {
    const fn to_atomic(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    const fn from_atomic(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures required to open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "failure_threshold must be greater than 0",
            ));
        }
        if self.cooldown.is_zero() {
            return Err(ResilienceError::invalid_config(
                "cooldown must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    last_probe_at: Option<Instant>,
    /// Invariant: at most one in-flight probe while half-open.
    probe_in_flight: bool,
    last_state_change: Instant,
    total_operations: u64,
    total_rejections: u64,
}

/// Circuit breaker with consecutive-failure counting.
///
/// The state machine: `Closed` counts consecutive transient failures and
/// opens at the threshold; `Open` fails fast with
/// [`ResilienceError::CircuitOpen`] until the cooldown elapses, then admits
/// exactly one probe in `HalfOpen`; a successful probe closes the circuit,
/// a transient probe failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    /// Mirror of `Inner::state` for lock-free reads (0=Closed, 1=Open,
    /// 2=HalfOpen). Updated under the inner lock.
    atomic_state: AtomicU8,
}

/// How a call was admitted through the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Normal closed-state call.
    Normal,
    /// The single half-open probe.
    Probe,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
                last_probe_at: None,
                probe_in_flight: false,
                last_state_change: Instant::now(),
                total_operations: 0,
                total_rejections: 0,
            }),
            atomic_state: AtomicU8::new(CircuitState::Closed.to_atomic()),
        })
    }

    /// Create a breaker with the given configuration, wrapped in an `Arc`
    /// for sharing across call sites.
    pub fn shared(config: CircuitBreakerConfig) -> Result<Arc<Self>, ResilienceError> {
        Self::new(config).map(Arc::new)
    }

    /// Current state without acquiring the lock.
    #[must_use]
    pub fn state_fast(&self) -> CircuitState {
        CircuitState::from_atomic(self.atomic_state.load(Ordering::Acquire))
    }

    /// Execute `operation` under breaker protection.
    ///
    /// Fails fast with [`ResilienceError::CircuitOpen`] without invoking
    /// the operation when the circuit is open (or half-open with a probe
    /// already in flight). Transient failures count toward opening;
    /// permanent failures propagate without touching breaker state.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteFailure>>,
    {
        let admission = self.try_acquire()?;
        let is_probe = admission == Admission::Probe;

        // If the caller drops this future mid-operation, the guard releases
        // the probe slot so a half-open circuit cannot wedge.
        let guard = ProbeGuard {
            breaker: self,
            armed: is_probe,
        };
        let result = operation().await;
        guard.defuse();

        match &result {
            Ok(_) => self.record_success(is_probe),
            Err(failure) if failure.is_transient() => self.record_transient_failure(is_probe),
            Err(failure) => {
                debug!(kind = %failure.kind, "permanent failure passed through breaker");
                self.release_probe(is_probe);
            }
        }

        result.map_err(ResilienceError::from)
    }

    /// Execute `operation` with retries per `policy`.
    ///
    /// Only transient failures are retried, sleeping between attempts per
    /// the policy (a service-supplied `retry_after` hint overrides the
    /// computed delay). Aborts immediately if the circuit opens
    /// mid-sequence; after exhausting attempts, returns
    /// [`ResilienceError::RetriesExhausted`] wrapping the last cause.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        mut operation: F,
        policy: &RetryPolicy,
    ) -> Result<T, ResilienceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteFailure>>,
    {
        policy.validate()?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.execute(&mut operation).await {
                Ok(value) => return Ok(value),
                Err(err @ ResilienceError::CircuitOpen { .. }) => {
                    debug!(attempt, "circuit opened mid-sequence, aborting retries");
                    return Err(err);
                }
                Err(ResilienceError::Remote(failure)) if failure.is_transient() => {
                    if attempt >= policy.max_attempts {
                        warn!(
                            attempts = attempt,
                            last = %failure,
                            "retries exhausted"
                        );
                        return Err(ResilienceError::RetriesExhausted {
                            attempts: attempt,
                            last: failure,
                        });
                    }
                    let delay = failure
                        .retry_after
                        .unwrap_or_else(|| policy.delay_for(attempt - 1));
                    debug!(attempt, ?delay, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Reset the breaker to closed.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!("circuit breaker manually reset");
        self.set_state(&mut inner, CircuitState::Closed);
        inner.consecutive_failures = 0;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    /// Snapshot of breaker statistics.
    #[must_use]
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            last_probe_at: inner.last_probe_at,
            total_operations: inner.total_operations,
            total_rejections: inner.total_rejections,
        }
    }

    fn try_acquire(&self) -> Result<Admission, ResilienceError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.total_operations += 1;
                Ok(Admission::Normal)
            }
            CircuitState::Open => {
                let elapsed = inner.last_state_change.elapsed();
                if elapsed >= self.config.cooldown {
                    info!(
                        transition = %format!("{} -> {}", CircuitState::Open, CircuitState::HalfOpen),
                        "cooldown elapsed, admitting probe"
                    );
                    self.set_state(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    inner.last_probe_at = Some(Instant::now());
                    inner.total_operations += 1;
                    Ok(Admission::Probe)
                } else {
                    inner.total_rejections += 1;
                    Err(ResilienceError::CircuitOpen {
                        retry_after: self.config.cooldown.checked_sub(elapsed),
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.total_rejections += 1;
                    Err(ResilienceError::CircuitOpen { retry_after: None })
                } else {
                    inner.probe_in_flight = true;
                    inner.last_probe_at = Some(Instant::now());
                    inner.total_operations += 1;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn record_success(&self, is_probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if is_probe {
            inner.probe_in_flight = false;
        }
        if inner.state == CircuitState::HalfOpen {
            info!(
                transition = %format!("{} -> {}", CircuitState::HalfOpen, CircuitState::Closed),
                "probe succeeded, circuit closed"
            );
            self.set_state(&mut inner, CircuitState::Closed);
        }
    }

    fn record_transient_failure(&self, is_probe: bool) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        if is_probe {
            inner.probe_in_flight = false;
        }

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "failure threshold reached, circuit opened"
                    );
                    self.set_state(&mut inner, CircuitState::Open);
                } else {
                    debug!(
                        failures = inner.consecutive_failures,
                        threshold = self.config.failure_threshold,
                        "transient failure recorded"
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!("probe failed, circuit reopened");
                self.set_state(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn release_probe(&self, is_probe: bool) {
        if is_probe {
            // Permanent failure resolved the probe without proving recovery
            // either way; the circuit stays half-open and the next caller
            // gets to probe.
            self.inner.lock().probe_in_flight = false;
        }
    }

    fn set_state(&self, inner: &mut Inner, state: CircuitState) {
        inner.state = state;
        inner.last_state_change = Instant::now();
        self.atomic_state.store(state.to_atomic(), Ordering::Release);
    }
}

/// Clears the probe slot if the guarded future is dropped before the call
/// resolves.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn defuse(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.inner.lock().probe_in_flight = false;
        }
    }
}

/// Circuit breaker statistics snapshot.
#[derive(Debug, Clone)]
pub struct CircuitStats {
    /// Current phase.
    pub state: CircuitState,
    /// Transient failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the last counted failure.
    pub last_failure_at: Option<Instant>,
    /// Time the last half-open probe was admitted.
    pub last_probe_at: Option<Instant>,
    /// Calls admitted through the breaker.
    pub total_operations: u64,
    /// Calls rejected while open or half-open.
    pub total_rejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::retry::Backoff;

    fn transient() -> RemoteFailure {
        RemoteFailure::new(FailureKind::Server, "503")
    }

    fn permanent() -> RemoteFailure {
        RemoteFailure::new(FailureKind::Validation, "bad payload")
    }

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
        .unwrap()
    }

    #[test]
    fn zero_threshold_rejected() {
        let err = CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 0,
            cooldown: Duration::from_secs(1),
        })
        .unwrap_err();
        assert!(err.to_string().contains("failure_threshold"));
    }

    #[tokio::test]
    async fn starts_closed_and_stays_closed_on_success() {
        let cb = breaker(3, Duration::from_secs(1));
        for _ in 0..10 {
            let out = cb.execute(|| async { Ok::<_, RemoteFailure>(1) }).await;
            assert!(out.is_ok());
        }
        assert_eq!(cb.state_fast(), CircuitState::Closed);
        assert_eq!(cb.stats().total_operations, 10);
    }

    #[tokio::test]
    async fn opens_exactly_at_threshold() {
        let cb = breaker(3, Duration::from_secs(60));

        for i in 0..3 {
            let out = cb
                .execute(|| async { Err::<(), _>(transient()) })
                .await;
            assert!(out.is_err());
            if i < 2 {
                assert_eq!(cb.state_fast(), CircuitState::Closed);
            }
        }
        assert_eq!(cb.state_fast(), CircuitState::Open);

        // 4th call fails fast without invoking the operation.
        let mut invoked = false;
        let out = cb
            .execute(|| {
                invoked = true;
                async { Ok::<_, RemoteFailure>(()) }
            })
            .await;
        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
        assert!(!invoked);
        assert_eq!(cb.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn permanent_failures_do_not_count() {
        let cb = breaker(2, Duration::from_secs(60));
        for _ in 0..5 {
            let out = cb
                .execute(|| async { Err::<(), _>(permanent()) })
                .await;
            assert!(matches!(out, Err(ResilienceError::Remote(_))));
        }
        assert_eq!(cb.state_fast(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        }
        let _ = cb.execute(|| async { Ok::<_, RemoteFailure>(()) }).await;
        assert_eq!(cb.stats().consecutive_failures, 0);

        // Two more failures still do not open a threshold-3 breaker.
        for _ in 0..2 {
            let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        }
        assert_eq!(cb.state_fast(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_then_closes_on_success() {
        let cb = breaker(1, Duration::from_millis(100));
        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state_fast(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;

        let out = cb.execute(|| async { Ok::<_, RemoteFailure>(7) }).await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(cb.state_fast(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let cb = breaker(1, Duration::from_millis(100));
        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state_fast(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn single_probe_while_half_open() {
        let cb = Arc::new(breaker(1, Duration::from_millis(100)));
        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();

        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async {
                    let _ = started_tx.send(());
                    let _ = release_rx.await;
                    Ok::<_, RemoteFailure>(())
                })
                .await
        });

        started_rx.await.unwrap();

        // Second caller while the probe is in flight is rejected without
        // invoking its operation.
        let mut invoked = false;
        let out = cb
            .execute(|| {
                invoked = true;
                async { Ok::<_, RemoteFailure>(()) }
            })
            .await;
        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
        assert!(!invoked);

        let _ = release_tx.send(());
        probe.await.unwrap().unwrap();
        assert_eq!(cb.state_fast(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_releases_slot() {
        let cb = Arc::new(breaker(1, Duration::from_millis(100)));
        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        let probe_cb = Arc::clone(&cb);
        let probe = tokio::spawn(async move {
            probe_cb
                .execute(|| async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, RemoteFailure>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        probe.abort();
        let _ = probe.await;

        // The slot is free again: the next caller becomes the probe.
        let out = cb.execute(|| async { Ok::<_, RemoteFailure>(()) }).await;
        assert!(out.is_ok());
        assert_eq!(cb.state_fast(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_invokes_exactly_max_attempts_with_exponential_delays() {
        let cb = breaker(100, Duration::from_secs(60));
        let policy = RetryPolicy::new(
            3,
            Backoff::Exponential,
            Duration::from_millis(100),
            Duration::from_secs(10),
        )
        .unwrap();

        let calls = std::sync::atomic::AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let out = cb
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(transient()) }
                },
                &policy,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 100ms after attempt 1 + 200ms after attempt 2, under paused time.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        match out {
            Err(ResilienceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_transient());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retry_does_not_touch_permanent_failures() {
        let cb = breaker(100, Duration::from_secs(60));
        let calls = std::sync::atomic::AtomicU32::new(0);
        let out = cb
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(permanent()) }
                },
                &RetryPolicy::default(),
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(out, Err(ResilienceError::Remote(_))));
    }

    #[tokio::test]
    async fn retry_aborts_when_circuit_opens_mid_sequence() {
        let cb = breaker(2, Duration::from_secs(60));
        let policy = RetryPolicy::new(
            5,
            Backoff::None,
            Duration::ZERO,
            Duration::ZERO,
        )
        .unwrap();

        let calls = std::sync::atomic::AtomicU32::new(0);
        let out = cb
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(transient()) }
                },
                &policy,
            )
            .await;

        // Attempts 1 and 2 open the circuit; attempt 3 is rejected without
        // invoking the operation and the loop aborts.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(out, Err(ResilienceError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_honors_service_backoff_hint() {
        let cb = breaker(100, Duration::from_secs(60));
        let policy = RetryPolicy::new(
            2,
            Backoff::Fixed,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
        .unwrap();

        let started = tokio::time::Instant::now();
        let calls = std::sync::atomic::AtomicU32::new(0);
        let _ = cb
            .execute_with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(
                            RemoteFailure::new(FailureKind::RateLimited, "slow down")
                                .with_retry_after(Duration::from_millis(500)),
                        )
                    }
                },
                &policy,
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let cb = breaker(1, Duration::from_secs(60));
        let _ = cb.execute(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(cb.state_fast(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state_fast(), CircuitState::Closed);
        assert_eq!(cb.stats().consecutive_failures, 0);
    }
}
