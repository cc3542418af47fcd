//! The orchestrator facade.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use pollux_cache::{CacheMetrics, ExecutionCache};
use pollux_core::{ExecutionHandle, ExecutionId, QueueItemId};
use pollux_queue::{
    ExecutionQueue, QueueExecutor, QueueItem, QueueMetrics, QueueTicket,
};
use pollux_resilience::{CircuitBreaker, CircuitStats, ResilienceError, RetryPolicy};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::{RemoteExecutionClient, with_timeout};
use crate::config::OrchestratorConfig;
use crate::error::EngineError;
use crate::poll::PollStrategy;

/// Shared internals: client, breaker, cache, and poll parameters.
///
/// One instance backs the orchestrator, its queue executor, and every
/// polling stream.
pub(crate) struct EngineCore {
    pub(crate) client: Arc<dyn RemoteExecutionClient>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) cache: ExecutionCache,
    pub(crate) retry: RetryPolicy,
    pub(crate) strategy: PollStrategy,
    pub(crate) call_timeout: Duration,
    /// Cancelled on forced shutdown; queue-driven executions observe it.
    pub(crate) cancel: CancellationToken,
    /// Queue item to remote execution mapping, recorded at start time.
    pub(crate) executions: Mutex<HashMap<QueueItemId, ExecutionId>>,
}

impl EngineCore {
    /// Breaker-wrapped, retried start call. Seeds the cache with the
    /// initial `Pending` snapshot on success.
    pub(crate) async fn start_remote(
        &self,
        payload: serde_json::Value,
    ) -> Result<ExecutionId, ResilienceError> {
        let id = self
            .breaker
            .execute_with_retry(
                || {
                    let client = Arc::clone(&self.client);
                    let payload = payload.clone();
                    let limit = self.call_timeout;
                    async move { with_timeout(limit, client.start(payload)).await }
                },
                &self.retry,
            )
            .await?;
        self.cache.set(id, ExecutionHandle::started(id));
        debug!(%id, "execution started");
        Ok(id)
    }
}

/// Adapter dispatching queue items into the engine core.
struct QueueBridge {
    core: Arc<EngineCore>,
}

#[async_trait]
impl QueueExecutor for QueueBridge {
    async fn execute(&self, item: &QueueItem) -> Result<(), ResilienceError> {
        let id = self.core.start_remote(item.payload.clone()).await?;
        self.core.executions.lock().insert(item.id, id);

        // The item completes when the execution settles, whatever its
        // terminal status; callers read the outcome from the snapshot.
        let handle = self.core.await_terminal(id, &self.core.cancel).await?;
        debug!(item = %item.id, execution = %id, status = %handle.status, "queue item settled");
        Ok(())
    }
}

/// Combined metrics snapshot across all components.
#[derive(Debug, Clone)]
pub struct OrchestratorMetrics {
    /// Circuit breaker statistics.
    pub circuit: CircuitStats,
    /// Cache counters.
    pub cache: CacheMetrics,
    /// Queue state counts.
    pub queue: QueueMetrics,
}

/// Facade owning the breaker, cache, queue, and remote client.
///
/// Construct one per remote execution service; clones of its internals are
/// shared by every operation it spawns.
pub struct Orchestrator {
    pub(crate) core: Arc<EngineCore>,
    pub(crate) queue: ExecutionQueue,
    /// Root token; composition operators derive child tokens from it.
    pub(crate) cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator over `client` with a validated configuration.
    pub fn new(
        config: OrchestratorConfig,
        client: Arc<dyn RemoteExecutionClient>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let cancel = CancellationToken::new();
        let core = Arc::new(EngineCore {
            client,
            breaker: CircuitBreaker::shared(config.circuit)?,
            cache: ExecutionCache::new(config.cache)?,
            retry: config.retry,
            strategy: config.poll,
            call_timeout: config.call_timeout,
            cancel: cancel.child_token(),
            executions: Mutex::new(HashMap::new()),
        });
        let bridge = Arc::new(QueueBridge {
            core: Arc::clone(&core),
        });
        let queue = ExecutionQueue::new(config.queue, bridge)?;
        Ok(Self { core, queue, cancel })
    }

    /// Admit a start request into the queue.
    ///
    /// The returned ticket settles once the started execution reaches a
    /// terminal status (or the start machinery fails).
    pub fn enqueue_execution(
        &self,
        payload: serde_json::Value,
        priority: u8,
    ) -> Result<QueueTicket, EngineError> {
        Ok(self.queue.enqueue(payload, priority)?)
    }

    /// Remote execution id started for a queue item, once known.
    #[must_use]
    pub fn execution_of(&self, item: QueueItemId) -> Option<ExecutionId> {
        self.core.executions.lock().get(&item).copied()
    }

    /// Stream of observed snapshots for one execution.
    ///
    /// Cache-first on every tick, distinct-until-changed, ends after the
    /// terminal snapshot or an unrecoverable error. Dropping the stream
    /// stops polling synchronously.
    pub fn watch_execution(
        &self,
        id: ExecutionId,
    ) -> impl Stream<Item = Result<ExecutionHandle, EngineError>> + Send + 'static {
        self.core
            .watch_stream(id)
            .map(|item| item.map_err(EngineError::from))
    }

    /// Resume a waiting execution, then invalidate its cached snapshot so
    /// the next poll observes the post-resume state.
    pub async fn resume_execution(
        &self,
        id: ExecutionId,
        input: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.core
            .breaker
            .execute_with_retry(
                || {
                    let client = Arc::clone(&self.core.client);
                    let input = input.clone();
                    let limit = self.core.call_timeout;
                    async move { with_timeout(limit, client.resume(id, input)).await }
                },
                &self.core.retry,
            )
            .await?;
        self.core.cache.invalidate(id);
        Ok(())
    }

    /// Cancel a running execution, then invalidate its cached snapshot.
    pub async fn cancel_execution(&self, id: ExecutionId) -> Result<(), EngineError> {
        self.core
            .breaker
            .execute_with_retry(
                || {
                    let client = Arc::clone(&self.core.client);
                    let limit = self.core.call_timeout;
                    async move { with_timeout(limit, client.cancel(id)).await }
                },
                &self.core.retry,
            )
            .await?;
        self.core.cache.invalidate(id);
        Ok(())
    }

    /// Combined metrics across breaker, cache, and queue.
    #[must_use]
    pub fn metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            circuit: self.core.breaker.stats(),
            cache: self.core.cache.metrics(),
            queue: self.queue.metrics(),
        }
    }

    /// Stop admitting work and wait for in-flight executions to settle.
    pub async fn shutdown_graceful(&self) {
        self.queue.shutdown_graceful().await;
    }

    /// Stop immediately: cancel in-flight executions and abandon pending
    /// work.
    pub async fn shutdown_now(&self) {
        self.cancel.cancel();
        self.queue.shutdown_now().await;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("circuit", &self.core.breaker.state_fast())
            .field("queue", &self.queue.metrics())
            .finish_non_exhaustive()
    }
}
