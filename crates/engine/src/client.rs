//! The remote execution client seam.

use std::time::Duration;

use async_trait::async_trait;
use pollux_core::{ExecutionHandle, ExecutionId};
use pollux_resilience::{FailureKind, RemoteFailure};

/// Transport-agnostic client for the remote execution service.
///
/// Implementations perform the actual wire calls; everything above this
/// trait (circuit breaking, retries, caching, polling) is transport-free.
/// `resume` and `cancel` default to a permanent `Client` failure for
/// services that do not support them.
#[async_trait]
pub trait RemoteExecutionClient: Send + Sync + 'static {
    /// Start a new execution from an opaque payload.
    async fn start(&self, payload: serde_json::Value) -> Result<ExecutionId, RemoteFailure>;

    /// Fetch the current snapshot of an execution.
    async fn fetch(&self, id: ExecutionId) -> Result<ExecutionHandle, RemoteFailure>;

    /// Resume a waiting execution with additional input.
    async fn resume(
        &self,
        id: ExecutionId,
        input: serde_json::Value,
    ) -> Result<(), RemoteFailure> {
        let _ = (id, input);
        Err(RemoteFailure::new(
            FailureKind::Client,
            "resume is not supported by this client",
        ))
    }

    /// Request cancellation of a running execution.
    async fn cancel(&self, id: ExecutionId) -> Result<(), RemoteFailure> {
        let _ = id;
        Err(RemoteFailure::new(
            FailureKind::Client,
            "cancel is not supported by this client",
        ))
    }
}

/// Bound `call` by `limit`, classifying expiry as a transient timeout.
///
/// Every remote call goes through this wrapper so a hung transport surfaces
/// as a retry-eligible failure instead of stalling the caller.
pub(crate) async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> Result<T, RemoteFailure>
where
    Fut: Future<Output = Result<T, RemoteFailure>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteFailure::timeout(limit)),
    }
}
