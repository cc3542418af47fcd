//! Composition operators over the queue, cache, breaker, and poller.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use pollux_core::ExecutionHandle;
use pollux_queue::QueueError;
use pollux_resilience::ResilienceError;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;

/// Outcome of one child execution within a composite operation.
pub type ChildResult = Result<ExecutionHandle, EngineError>;

/// How a parallel group reacts to a child failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// First failure cancels the remaining children and fails the group.
    AllOrFail,
    /// Every child runs to its own outcome.
    BestEffort,
}

/// How a sequential chain reacts to a child failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Stop the chain at the first failure.
    Stop,
    /// Keep starting the remaining executions.
    Continue,
}

impl Orchestrator {
    /// Start one execution and poll it to a terminal snapshot.
    ///
    /// `cancel` is observed both before the start call and throughout
    /// polling; a cancelled child settles as `Cancelled` without applying
    /// any late result.
    async fn run_child(
        &self,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> ChildResult {
        tokio::select! {
            () = cancel.cancelled() => Err(EngineError::from(ResilienceError::Cancelled)),
            started = self.core.start_remote(payload) => {
                let id = started?;
                let handle = self.core.await_terminal(id, cancel).await?;
                Ok(handle)
            }
        }
    }

    /// Start every payload concurrently.
    ///
    /// `AllOrFail` returns the first failure after cancelling the remaining
    /// children; `BestEffort` always returns one result per payload, in
    /// input order.
    pub async fn start_parallel(
        &self,
        payloads: Vec<serde_json::Value>,
        mode: FailureMode,
    ) -> Result<Vec<ChildResult>, EngineError> {
        let count = payloads.len();
        let token = self.cancel.child_token();
        let mut children: FuturesUnordered<_> = payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| {
                let token = token.clone();
                async move { (index, self.run_child(payload, &token).await) }
            })
            .collect();

        let mut results: Vec<ChildResult> = (0..count)
            .map(|_| Err(EngineError::from(ResilienceError::Cancelled)))
            .collect();
        while let Some((index, result)) = children.next().await {
            match result {
                Err(err) if mode == FailureMode::AllOrFail => {
                    debug!(%err, "parallel group failed, cancelling siblings");
                    token.cancel();
                    // Dropping the set drops the sibling futures; polling
                    // stops before this call returns.
                    drop(children);
                    return Err(err);
                }
                other => results[index] = other,
            }
        }
        Ok(results)
    }

    /// Start payloads one at a time, each only after the previous settled.
    ///
    /// With [`OnFailure::Stop`] the returned vector ends at the first
    /// failure; with [`OnFailure::Continue`] it has one entry per payload.
    pub async fn start_sequential(
        &self,
        payloads: Vec<serde_json::Value>,
        on_failure: OnFailure,
    ) -> Vec<ChildResult> {
        let token = self.cancel.child_token();
        let mut results = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let result = self.run_child(payload, &token).await;
            let failed = result.is_err();
            results.push(result);
            if failed && on_failure == OnFailure::Stop {
                debug!("sequential chain stopped at first failure");
                break;
            }
        }
        results
    }

    /// Start every payload concurrently and return the first terminal
    /// snapshot, cancelling the rest.
    ///
    /// If every child fails, the last failure is returned.
    pub async fn start_race(
        &self,
        payloads: Vec<serde_json::Value>,
    ) -> Result<ExecutionHandle, EngineError> {
        if payloads.is_empty() {
            return Err(EngineError::invalid_config(
                "race requires at least one payload",
            ));
        }

        let token = self.cancel.child_token();
        let mut children: FuturesUnordered<_> = payloads
            .into_iter()
            .map(|payload| {
                let token = token.clone();
                async move { self.run_child(payload, &token).await }
            })
            .collect();

        let mut last_error = None;
        while let Some(result) = children.next().await {
            match result {
                Ok(handle) => {
                    debug!(id = %handle.id, "race settled, cancelling remaining children");
                    token.cancel();
                    drop(children);
                    return Ok(handle);
                }
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.unwrap_or_else(|| EngineError::from(ResilienceError::Cancelled)))
    }

    /// Admit payloads through the queue in bounded batches.
    ///
    /// Each batch is enqueued together and awaited in full before the next
    /// batch is admitted; within a batch the queue's own concurrency bound
    /// applies. A payload whose admission is rejected (e.g. the queue is
    /// shutting down) gets an `Err` in its slot; payloads already admitted
    /// in the same batch are still awaited, so no started work is dropped
    /// from the returned vector.
    pub async fn start_batch(
        &self,
        payloads: Vec<serde_json::Value>,
        batch_size: usize,
    ) -> Result<Vec<ChildResult>, EngineError> {
        if batch_size == 0 {
            return Err(EngineError::invalid_config(
                "batch_size must be greater than 0",
            ));
        }

        let mut results = Vec::with_capacity(payloads.len());
        let mut remaining = payloads.into_iter();
        loop {
            let batch: Vec<_> = remaining.by_ref().take(batch_size).collect();
            if batch.is_empty() {
                break;
            }

            let mut tickets = Vec::with_capacity(batch.len());
            for payload in batch {
                tickets.push(self.queue.enqueue(payload, 0));
            }
            for ticket in tickets {
                let result = match ticket {
                    Ok(ticket) => {
                        let item_id = ticket.id();
                        match ticket.completed().await {
                            Ok(_) => self.settled_handle(item_id).await,
                            Err(err) => Err(EngineError::from(err)),
                        }
                    }
                    Err(err) => Err(EngineError::from(err)),
                };
                results.push(result);
            }
        }
        Ok(results)
    }

    /// Terminal snapshot for a queue-driven execution, cache-first.
    async fn settled_handle(&self, item: pollux_core::QueueItemId) -> ChildResult {
        let Some(id) = self.core.executions.lock().get(&item).copied() else {
            return Err(EngineError::Queue(QueueError::ItemNotFound { id: item }));
        };
        Ok(self.core.fetch_snapshot(id).await?)
    }
}
