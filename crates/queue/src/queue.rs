//! The priority execution queue.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pollux_core::QueueItemId;
use pollux_resilience::ResilienceError;
use tokio::sync::{Notify, Semaphore, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::QueueError;
use crate::item::{QueueItem, QueueItemState};
use crate::metrics::QueueMetrics;

/// The execution function the queue dispatches admitted items into.
///
/// Implementations start the remote work for one item and return once it
/// has settled. A returned error marks the item `Failed` with that cause.
#[async_trait]
pub trait QueueExecutor: Send + Sync + 'static {
    /// Run the work for one dispatched item.
    async fn execute(&self, item: &QueueItem) -> Result<(), ResilienceError>;
}

/// Retention horizon for terminal items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many terminal items; the oldest are purged first.
    pub max_terminal_items: usize,
    /// Purge terminal items older than this.
    pub max_terminal_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_terminal_items: 256,
            max_terminal_age: Duration::from_secs(3600),
        }
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueConfig {
    /// Upper bound on simultaneously `Processing` items.
    pub max_concurrency: usize,
    /// Minimum interval between consecutive dispatches, independent of
    /// free slots.
    pub throttle: Option<Duration>,
    /// Purge horizon for terminal items.
    pub retention: RetentionPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            throttle: None,
            retention: RetentionPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), QueueError> {
        if self.max_concurrency == 0 {
            return Err(QueueError::InvalidConfig {
                message: "max_concurrency must be greater than 0".into(),
            });
        }
        if u32::try_from(self.max_concurrency).is_err() {
            return Err(QueueError::InvalidConfig {
                message: "max_concurrency exceeds the supported permit range".into(),
            });
        }
        if self.throttle.is_some_and(|d| d.is_zero()) {
            return Err(QueueError::InvalidConfig {
                message: "throttle interval must be greater than 0 when set".into(),
            });
        }
        if self.retention.max_terminal_age.is_zero() {
            return Err(QueueError::InvalidConfig {
                message: "max_terminal_age must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

/// Heap entry ordered highest-priority first, FIFO within a priority.
#[derive(Debug, PartialEq, Eq)]
struct PendingEntry {
    priority: u8,
    seq: u64,
    id: QueueItemId,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority wins, then lower
        // sequence (earlier enqueue) wins.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Slot {
    item: QueueItem,
    tx: watch::Sender<QueueItem>,
}

struct Shared {
    config: QueueConfig,
    executor: Arc<dyn QueueExecutor>,
    items: Mutex<HashMap<QueueItemId, Slot>>,
    pending: Mutex<BinaryHeap<PendingEntry>>,
    next_seq: AtomicU64,
    semaphore: Arc<Semaphore>,
    permits: u32,
    wakeup: Notify,
    accepting: AtomicBool,
    /// Stops the dispatcher; in-flight work keeps running.
    dispatch_token: CancellationToken,
    /// Cancels in-flight work on forced shutdown.
    kill_token: CancellationToken,
}

/// Priority queue that dispatches admitted start requests into an executor
/// under a concurrency bound.
pub struct ExecutionQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("config", &self.shared.config)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl ExecutionQueue {
    /// Create a queue and start its dispatch loop.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: QueueConfig, executor: Arc<dyn QueueExecutor>) -> Result<Self, QueueError> {
        config.validate()?;
        let permits = u32::try_from(config.max_concurrency).map_err(|_| {
            QueueError::InvalidConfig {
                message: "max_concurrency exceeds the supported permit range".into(),
            }
        })?;
        let shared = Arc::new(Shared {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            permits,
            config,
            executor,
            items: Mutex::new(HashMap::new()),
            pending: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
            wakeup: Notify::new(),
            accepting: AtomicBool::new(true),
            dispatch_token: CancellationToken::new(),
            kill_token: CancellationToken::new(),
        });
        tokio::spawn(Shared::dispatch_loop(Arc::clone(&shared)));
        Ok(Self { shared })
    }

    /// Admit a start request.
    ///
    /// Returns a [`QueueTicket`] exposing the item id and an awaitable
    /// completion.
    pub fn enqueue(
        &self,
        payload: serde_json::Value,
        priority: u8,
    ) -> Result<QueueTicket, QueueError> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(QueueError::ShuttingDown);
        }

        let id = QueueItemId::v4();
        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let item = QueueItem::new(id, payload, priority);
        let (tx, rx) = watch::channel(item.clone());

        self.shared.items.lock().insert(id, Slot { item, tx });
        self.shared
            .pending
            .lock()
            .push(PendingEntry { priority, seq, id });
        self.shared.wakeup.notify_one();

        debug!(item = %id, priority, "enqueued");
        Ok(QueueTicket { id, rx })
    }

    /// Snapshot of one tracked item, if it has not been purged.
    #[must_use]
    pub fn item(&self, id: QueueItemId) -> Option<QueueItem> {
        self.shared
            .items
            .lock()
            .get(&id)
            .map(|slot| slot.item.clone())
    }

    /// Aggregate state counts at this instant.
    #[must_use]
    pub fn metrics(&self) -> QueueMetrics {
        let items = self.shared.items.lock();
        let mut metrics = QueueMetrics::default();
        for slot in items.values() {
            match slot.item.state {
                QueueItemState::Pending => metrics.pending += 1,
                QueueItemState::Processing => metrics.processing += 1,
                QueueItemState::Completed => metrics.completed += 1,
                QueueItemState::Failed => metrics.failed += 1,
            }
        }
        metrics
    }

    /// Stop admitting new items and wait for in-flight work to finish.
    ///
    /// Items still `Pending` are left undispatched. Idempotent; never
    /// deadlocks.
    pub async fn shutdown_graceful(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.dispatch_token.cancel();
        info!("queue shutting down, draining in-flight items");
        // Every worker holds one permit; owning them all means the queue
        // is drained.
        if let Ok(all) = self.shared.semaphore.acquire_many(self.shared.permits).await {
            drop(all);
        }
    }

    /// Stop immediately: cancel in-flight work and abandon pending items.
    ///
    /// Abandoned and cancelled items settle as `Failed` with a cancellation
    /// cause, so every ticket resolves. Idempotent; never deadlocks.
    pub async fn shutdown_now(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.dispatch_token.cancel();
        self.shared.kill_token.cancel();
        info!("queue shutting down now, abandoning pending items");

        self.shared.pending.lock().clear();
        self.shared.abandon_undispatched();
        // Workers observe the kill token and settle promptly.
        if let Ok(all) = self.shared.semaphore.acquire_many(self.shared.permits).await {
            drop(all);
        }
    }
}

impl Drop for ExecutionQueue {
    fn drop(&mut self) {
        // Stop the dispatcher so a dropped queue does not leak its task.
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.dispatch_token.cancel();
    }
}

impl Shared {
    async fn dispatch_loop(shared: Arc<Self>) {
        'dispatch: loop {
            if shared.dispatch_token.is_cancelled() {
                break;
            }

            // Claim a slot before choosing an item: the heap must stay
            // intact while every slot is busy, so a higher-priority item
            // enqueued during the wait still dispatches ahead of anything
            // admitted earlier.
            let permit = tokio::select! {
                () = shared.dispatch_token.cancelled() => break,
                permit = Arc::clone(&shared.semaphore).acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
            };

            let entry = loop {
                let next = shared.pending.lock().pop();
                if let Some(entry) = next {
                    break entry;
                }
                tokio::select! {
                    () = shared.dispatch_token.cancelled() => break 'dispatch,
                    () = shared.wakeup.notified() => {}
                }
            };

            if let Some(item) = shared.mark_processing(entry.id) {
                debug!(item = %item.id, priority = item.priority, "dispatching");
                let worker = Arc::clone(&shared);
                tokio::spawn(async move {
                    // Biased: a cancellation-aware executor gets one poll to
                    // settle itself before the kill fallback drops it.
                    let result = tokio::select! {
                        biased;
                        result = worker.executor.execute(&item) => result,
                        () = worker.kill_token.cancelled() => Err(ResilienceError::Cancelled),
                    };
                    worker.finish(item.id, result);
                    drop(permit);
                    worker.apply_retention();
                });
            } else {
                drop(permit);
            }

            if let Some(interval) = shared.config.throttle {
                tokio::select! {
                    () = shared.dispatch_token.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    fn mark_processing(&self, id: QueueItemId) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let slot = items.get_mut(&id)?;
        if !slot.item.transition(QueueItemState::Processing) {
            return None;
        }
        let snapshot = slot.item.clone();
        let _ = slot.tx.send(snapshot.clone());
        Some(snapshot)
    }

    fn finish(&self, id: QueueItemId, result: Result<(), ResilienceError>) {
        let mut items = self.items.lock();
        let Some(slot) = items.get_mut(&id) else {
            return;
        };
        match result {
            Ok(()) => {
                slot.item.transition(QueueItemState::Completed);
                debug!(item = %id, "completed");
            }
            Err(cause) => {
                debug!(item = %id, %cause, "failed");
                slot.item.error = Some(cause);
                slot.item.transition(QueueItemState::Failed);
            }
        }
        let _ = slot.tx.send(slot.item.clone());
    }

    /// Settle every still-pending item as abandoned.
    fn abandon_undispatched(&self) {
        let mut items = self.items.lock();
        for slot in items.values_mut() {
            if slot.item.state == QueueItemState::Pending {
                slot.item.error = Some(ResilienceError::Cancelled);
                slot.item.transition(QueueItemState::Failed);
                let _ = slot.tx.send(slot.item.clone());
            }
        }
    }

    /// Purge terminal items beyond the configured age and count horizons.
    fn apply_retention(&self) {
        let retention = self.config.retention;
        let now = Utc::now();
        let max_age = chrono::Duration::from_std(retention.max_terminal_age)
            .unwrap_or_else(|_| chrono::Duration::MAX);

        let mut items = self.items.lock();
        items.retain(|_, slot| match (slot.item.state.is_terminal(), slot.item.completed_at) {
            (true, Some(at)) => now - at <= max_age,
            _ => true,
        });

        let mut terminal: Vec<_> = items
            .values()
            .filter(|slot| slot.item.state.is_terminal())
            .map(|slot| (slot.item.id, slot.item.completed_at))
            .collect();
        if terminal.len() > retention.max_terminal_items {
            terminal.sort_by_key(|(_, completed_at)| *completed_at);
            let overflow = terminal.len() - retention.max_terminal_items;
            for (id, _) in terminal.into_iter().take(overflow) {
                items.remove(&id);
            }
        }
    }
}

/// Handle for one admitted item.
///
/// Holds a `watch` subscription to the item's record; dropping the ticket
/// never affects the item itself.
#[derive(Debug)]
pub struct QueueTicket {
    id: QueueItemId,
    rx: watch::Receiver<QueueItem>,
}

impl QueueTicket {
    /// Id of the admitted item.
    #[must_use]
    pub fn id(&self) -> QueueItemId {
        self.id
    }

    /// Latest observed record for the item.
    #[must_use]
    pub fn snapshot(&self) -> QueueItem {
        self.rx.borrow().clone()
    }

    /// Wait until the item settles.
    ///
    /// Returns the terminal record on success, or the execution failure
    /// (including cancellation on forced shutdown) for `Failed` items.
    pub async fn completed(mut self) -> Result<QueueItem, QueueError> {
        loop {
            let item = self.rx.borrow_and_update().clone();
            if item.state.is_terminal() {
                return match item.error.clone() {
                    Some(cause) if item.state == QueueItemState::Failed => {
                        Err(QueueError::Execution(cause))
                    }
                    _ => Ok(item),
                };
            }
            if self.rx.changed().await.is_err() {
                // Purged before we observed a terminal record.
                return Err(QueueError::ItemNotFound { id: self.id });
            }
        }
    }
}
