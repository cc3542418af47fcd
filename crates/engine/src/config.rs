//! Orchestrator configuration.

use std::time::Duration;

use pollux_cache::CacheConfig;
use pollux_queue::QueueConfig;
use pollux_resilience::{CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::poll::PollStrategy;

/// Every orchestrator knob, explicitly enumerated.
///
/// Validated as a whole at construction; an orchestrator never runs with a
/// partially invalid configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Circuit breaker settings shared by all remote calls.
    pub circuit: CircuitBreakerConfig,
    /// Retry policy applied inside the breaker.
    pub retry: RetryPolicy,
    /// Poll interval schedule.
    pub poll: PollStrategy,
    /// Snapshot cache settings.
    pub cache: CacheConfig,
    /// Start-request queue settings.
    pub queue: QueueConfig,
    /// Timeout applied to every individual remote call.
    pub call_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            circuit: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            poll: PollStrategy::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.circuit.validate()?;
        self.retry.validate()?;
        self.poll.validate()?;
        self.cache.validate()?;
        self.queue.validate()?;
        if self.call_timeout.is_zero() {
            return Err(EngineError::invalid_config(
                "call_timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}
