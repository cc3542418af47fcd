//! Per-key watch streams.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pollux_core::ExecutionHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

/// Stream of snapshots for one watched key.
///
/// Emits on every `set` of the key and completes (yields `None`) when the
/// key is invalidated. A subscriber that falls far enough behind to lag the
/// broadcast buffer skips the dropped intermediate snapshots and continues
/// with the most recent ones — watchers care about the latest state, not
/// the full history.
#[derive(Debug)]
pub struct WatchStream {
    inner: BroadcastStream<ExecutionHandle>,
}

impl WatchStream {
    pub(crate) fn new(rx: tokio::sync::broadcast::Receiver<ExecutionHandle>) -> Self {
        Self {
            inner: BroadcastStream::new(rx),
        }
    }
}

impl Stream for WatchStream {
    type Item = ExecutionHandle;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match std::task::ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(handle)) => return Poll::Ready(Some(handle)),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "watch subscriber lagged, skipping stale snapshots");
                }
                None => return Poll::Ready(None),
            }
        }
    }
}
