//! The execution cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
// Respects tokio's paused test clock, unlike the std counterpart.
use tokio::time::Instant;
use pollux_core::{ExecutionHandle, ExecutionId};
use pollux_resilience::ResilienceError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::metrics::CacheMetrics;
use crate::watch::WatchStream;

/// Buffer depth for per-key channels. Watchers and coalesced waiters only
/// need the most recent few snapshots.
const CHANNEL_CAPACITY: usize = 16;

/// Cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    /// TTL applied by `set` when no override is given.
    pub default_ttl: Duration,
    /// Upper bound on stored entries; exceeding it evicts the oldest
    /// insertion.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.default_ttl.is_zero() {
            return Err(ResilienceError::invalid_config(
                "default_ttl must be greater than 0",
            ));
        }
        if self.max_entries == 0 {
            return Err(ResilienceError::invalid_config(
                "max_entries must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Entry {
    handle: ExecutionHandle,
    inserted_at: Instant,
    ttl: Duration,
    /// Monotonic insertion sequence, used for oldest-first eviction.
    seq: u64,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

type FetchResult = Result<ExecutionHandle, CacheError>;

struct Shared {
    config: CacheConfig,
    entries: Mutex<HashMap<ExecutionId, Entry>>,
    /// At most one in-flight fetch per key; joiners subscribe to the
    /// leader's channel instead of fetching again.
    inflight: Mutex<HashMap<ExecutionId, broadcast::Sender<FetchResult>>>,
    /// Per-key watch channels. Dropping a sender (on invalidation)
    /// completes every subscriber stream.
    watchers: Mutex<HashMap<ExecutionId, broadcast::Sender<ExecutionHandle>>>,
    metrics_tx: watch::Sender<CacheMetrics>,
    next_seq: Mutex<u64>,
}

/// TTL-keyed store of the last known execution snapshot.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct ExecutionCache {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ExecutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionCache")
            .field("config", &self.shared.config)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Result<Self, ResilienceError> {
        config.validate()?;
        let (metrics_tx, _) = watch::channel(CacheMetrics::default());
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                entries: Mutex::new(HashMap::new()),
                inflight: Mutex::new(HashMap::new()),
                watchers: Mutex::new(HashMap::new()),
                metrics_tx,
                next_seq: Mutex::new(0),
            }),
        })
    }

    /// Create a cache with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default()).expect("default cache configuration is valid")
    }

    /// Read the fresh snapshot for `key`, if any.
    ///
    /// TTL is evaluated lazily: an expired entry behaves as a miss and is
    /// dropped on the spot. Corrupted entries (key/id mismatch) are
    /// invalidated and reported as a miss rather than served.
    #[must_use]
    pub fn get(&self, key: ExecutionId) -> Option<ExecutionHandle> {
        let mut entries = self.shared.entries.lock();
        let now = Instant::now();
        match entries.get(&key) {
            Some(entry) if entry.handle.id != key => {
                warn!(%key, "cache entry id mismatch, invalidating corrupted entry");
                entries.remove(&key);
                drop(entries);
                self.bump(|m| {
                    m.invalidations += 1;
                    m.misses += 1;
                });
                None
            }
            Some(entry) if entry.is_expired(now) => {
                entries.remove(&key);
                drop(entries);
                self.bump(|m| {
                    m.evictions += 1;
                    m.misses += 1;
                });
                None
            }
            Some(entry) => {
                let handle = entry.handle.clone();
                drop(entries);
                self.bump(|m| m.hits += 1);
                Some(handle)
            }
            None => {
                drop(entries);
                self.bump(|m| m.misses += 1);
                None
            }
        }
    }

    /// Store a snapshot under the default TTL.
    ///
    /// Returns `false` if the write was rejected by the monotonicity guard:
    /// once a terminal snapshot is recorded for a key, an active-status
    /// snapshot (e.g. from a stale fetch completing late) never replaces it.
    pub fn set(&self, key: ExecutionId, handle: ExecutionHandle) -> bool {
        self.set_with_ttl(key, handle, self.shared.config.default_ttl)
    }

    /// Store a snapshot with an explicit TTL.
    pub fn set_with_ttl(&self, key: ExecutionId, handle: ExecutionHandle, ttl: Duration) -> bool {
        let evicted = {
            let mut entries = self.shared.entries.lock();
            let now = Instant::now();

            if let Some(existing) = entries.get(&key)
                && !existing.is_expired(now)
                && existing.handle.status.rank() > handle.status.rank()
            {
                debug!(
                    %key,
                    existing = %existing.handle.status,
                    incoming = %handle.status,
                    "rejected non-monotonic snapshot write"
                );
                return false;
            }

            let seq = {
                let mut next = self.shared.next_seq.lock();
                *next += 1;
                *next
            };
            entries.insert(
                key,
                Entry {
                    handle: handle.clone(),
                    inserted_at: now,
                    ttl,
                    seq,
                },
            );

            // Capacity pressure evicts the oldest insertion.
            if entries.len() > self.shared.config.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.seq)
                    .map(|(k, _)| *k);
                if let Some(victim) = oldest {
                    entries.remove(&victim);
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        self.bump(|m| {
            m.sets += 1;
            if evicted {
                m.evictions += 1;
            }
        });
        self.notify_watchers(key, handle);
        true
    }

    /// Read `key`, fetching it through `fetch` on a miss.
    ///
    /// At most one fetch per key is in flight at any time: concurrent
    /// callers for the same missing or expired key await the single shared
    /// fetch and all resolve to its result. The fetched snapshot is written
    /// back (last-write-wins by fetch completion time) before being
    /// returned.
    pub async fn get_or_fetch<F, Fut>(&self, key: ExecutionId, fetch: F) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ExecutionHandle, ResilienceError>>,
    {
        enum Role {
            Leader(broadcast::Sender<FetchResult>),
            Follower(broadcast::Receiver<FetchResult>),
        }

        let mut fetch = Some(fetch);
        loop {
            if let Some(handle) = self.get(key) {
                return Ok(handle);
            }

            let role = {
                let mut inflight = self.shared.inflight.lock();
                match inflight.get(&key) {
                    Some(tx) => Role::Follower(tx.subscribe()),
                    None => {
                        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                        inflight.insert(key, tx.clone());
                        Role::Leader(tx)
                    }
                }
            };

            let tx = match role {
                Role::Follower(mut rx) => match rx.recv().await {
                    Ok(result) => return result,
                    // Leader abandoned (dropped mid-fetch). Loop around and
                    // elect a new one.
                    Err(_) => continue,
                },
                Role::Leader(tx) => tx,
            };

            // Leader path; reached at most once since it always returns.
            // The guard removes the inflight registration even if this
            // future is dropped mid-fetch, closing the channel so followers
            // re-elect instead of hanging.
            let guard = InflightGuard { cache: self, key };
            let fetch_fn = fetch.take().expect("leader elected once per call");
            let result = match fetch_fn().await {
                Ok(handle) if handle.id != key => {
                    warn!(%key, got = %handle.id, "fetched snapshot for wrong execution");
                    Err(CacheError::Corrupted { key })
                }
                Ok(handle) => {
                    self.set(key, handle.clone());
                    Ok(handle)
                }
                Err(err) => Err(CacheError::Fetch(err)),
            };
            drop(guard);
            let _ = tx.send(result.clone());
            return result;
        }
    }

    /// Subscribe to snapshot updates for `key`.
    ///
    /// The stream yields nothing until the next `set`, emits every
    /// subsequent `set`, and completes when the key is invalidated.
    #[must_use]
    pub fn watch(&self, key: ExecutionId) -> WatchStream {
        let mut watchers = self.shared.watchers.lock();
        let tx = watchers
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        WatchStream::new(tx.subscribe())
    }

    /// Remove the entry for `key` and complete its watch streams.
    ///
    /// Invalidating an absent key is a no-op: counters are unchanged and no
    /// watcher completes.
    pub fn invalidate(&self, key: ExecutionId) {
        let removed = self.shared.entries.lock().remove(&key).is_some();
        let had_watchers = self.shared.watchers.lock().remove(&key).is_some();
        if removed || had_watchers {
            debug!(%key, "invalidated");
        }
        if removed {
            self.bump(|m| m.invalidations += 1);
        }
    }

    /// Remove every entry matching `predicate` and complete the affected
    /// watch streams, returning how many entries were removed.
    pub fn invalidate_where(
        &self,
        mut predicate: impl FnMut(&ExecutionId, &ExecutionHandle) -> bool,
    ) -> usize {
        let victims: Vec<ExecutionId> = {
            let mut entries = self.shared.entries.lock();
            let mut removed = Vec::new();
            entries.retain(|key, entry| {
                if predicate(key, &entry.handle) {
                    removed.push(*key);
                    false
                } else {
                    true
                }
            });
            removed
        };
        if victims.is_empty() {
            return 0;
        }
        {
            let mut watchers = self.shared.watchers.lock();
            for key in &victims {
                watchers.remove(key);
            }
        }
        debug!(removed = victims.len(), "invalidated matching entries");
        self.bump(|m| m.invalidations += victims.len() as u64);
        victims.len()
    }

    /// Remove every entry and complete every watch stream.
    pub fn invalidate_all(&self) {
        let removed = {
            let mut entries = self.shared.entries.lock();
            let n = entries.len() as u64;
            entries.clear();
            n
        };
        self.shared.watchers.lock().clear();
        if removed > 0 {
            debug!(removed, "invalidated all entries");
            self.bump(|m| m.invalidations += removed);
        }
    }

    /// Drop every expired entry eagerly, returning how many were removed.
    ///
    /// Expiry is otherwise lazy (evaluated on read); this sweep exists for
    /// callers that want to bound memory between reads.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = {
            let mut entries = self.shared.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            before - entries.len()
        };
        if removed > 0 {
            self.bump(|m| m.evictions += removed as u64);
        }
        removed
    }

    /// Number of stored entries, including not-yet-collected expired ones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Returns `true` if no entries are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counter snapshot.
    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        *self.shared.metrics_tx.borrow()
    }

    /// Reactive metrics channel; the receiver observes every counter change.
    #[must_use]
    pub fn metrics_watch(&self) -> watch::Receiver<CacheMetrics> {
        self.shared.metrics_tx.subscribe()
    }

    fn bump(&self, update: impl FnOnce(&mut CacheMetrics)) {
        self.shared.metrics_tx.send_modify(update);
    }

    fn notify_watchers(&self, key: ExecutionId, handle: ExecutionHandle) {
        let watchers = self.shared.watchers.lock();
        if let Some(tx) = watchers.get(&key) {
            // Send fails when no subscriber is currently listening; the
            // channel stays registered for future subscribers.
            let _ = tx.send(handle);
        }
    }
}

/// Removes the in-flight registration for the leader, including when the
/// leader future is dropped before completing.
struct InflightGuard<'a> {
    cache: &'a ExecutionCache,
    key: ExecutionId,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.cache.shared.inflight.lock().remove(&self.key);
    }
}
