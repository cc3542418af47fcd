//! Integration tests for request coalescing and watch streams.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures::StreamExt;
use pollux_cache::{CacheConfig, CacheError, ExecutionCache};
use pollux_core::{ExecutionHandle, ExecutionId, ExecutionStatus};
use pollux_resilience::{FailureKind, RemoteFailure, ResilienceError};
use pretty_assertions::assert_eq;
use serde_json::json;

fn snapshot(key: ExecutionId, status: ExecutionStatus) -> ExecutionHandle {
    ExecutionHandle::started(key).observed(status, json!({"step": 1}), None)
}

#[tokio::test(start_paused = true)]
async fn ten_concurrent_fetches_coalesce_into_one() {
    let cache = ExecutionCache::with_defaults();
    let key = ExecutionId::v4();
    let fetches = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_fetch(key, || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(snapshot(key, ExecutionStatus::Running))
                })
                .await
        }));
    }

    for task in tasks {
        let handle = task.await.unwrap().unwrap();
        assert_eq!(handle.id, key);
        assert_eq!(handle.status, ExecutionStatus::Running);
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "exactly one shared fetch");
    assert_eq!(cache.metrics().sets, 1);
}

#[tokio::test(start_paused = true)]
async fn coalesced_waiters_share_the_failure() {
    let cache = ExecutionCache::with_defaults();
    let key = ExecutionId::v4();
    let fetches = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let fetches = Arc::clone(&fetches);
        tasks.push(tokio::spawn(async move {
            cache
                .get_or_fetch(key, || async move {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Err(ResilienceError::from(RemoteFailure::new(
                        FailureKind::Server,
                        "503 from upstream",
                    )))
                })
                .await
        }));
    }

    for task in tasks {
        let err = task.await.unwrap().unwrap_err();
        match err {
            CacheError::Fetch(ResilienceError::Remote(failure)) => {
                assert_eq!(failure.kind, FailureKind::Server);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
    assert!(cache.get(key).is_none(), "failures are not cached");
}

#[tokio::test(start_paused = true)]
async fn expired_entry_triggers_a_single_refetch() {
    let cache = ExecutionCache::with_defaults();
    let key = ExecutionId::v4();
    cache.set_with_ttl(key, snapshot(key, ExecutionStatus::Pending), Duration::from_millis(10));

    tokio::time::sleep(Duration::from_millis(50)).await;

    let fetches = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fetches);
    let handle = cache
        .get_or_fetch(key, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(snapshot(key, ExecutionStatus::Running))
        })
        .await
        .unwrap();

    assert_eq!(handle.status, ExecutionStatus::Running);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn watch_emits_every_set_and_completes_on_invalidate() {
    let cache = ExecutionCache::with_defaults();
    let key = ExecutionId::v4();
    let mut stream = cache.watch(key);

    cache.set(key, snapshot(key, ExecutionStatus::Pending));
    cache.set(key, snapshot(key, ExecutionStatus::Running));

    assert_eq!(stream.next().await.unwrap().status, ExecutionStatus::Pending);
    assert_eq!(stream.next().await.unwrap().status, ExecutionStatus::Running);

    cache.invalidate(key);
    assert!(stream.next().await.is_none(), "stream completes on invalidation");
}

#[tokio::test]
async fn watch_is_scoped_to_its_key() {
    let cache = ExecutionCache::with_defaults();
    let watched = ExecutionId::v4();
    let other = ExecutionId::v4();
    let mut stream = cache.watch(watched);

    cache.set(other, snapshot(other, ExecutionStatus::Running));
    cache.set(watched, snapshot(watched, ExecutionStatus::Success));

    let emitted = stream.next().await.unwrap();
    assert_eq!(emitted.id, watched);
    assert_eq!(emitted.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn metrics_watch_observes_counter_changes() {
    let cache = ExecutionCache::with_defaults();
    let key = ExecutionId::v4();
    let mut rx = cache.metrics_watch();

    assert_eq!(rx.borrow_and_update().sets, 0);

    cache.set(key, snapshot(key, ExecutionStatus::Running));
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().sets, 1);

    let _ = cache.get(key);
    rx.changed().await.unwrap();
    assert_eq!(rx.borrow_and_update().hits, 1);
}

#[tokio::test]
async fn repeated_invalidation_is_idempotent() {
    let cache = ExecutionCache::new(CacheConfig::default()).unwrap();
    let key = ExecutionId::v4();
    cache.set(key, snapshot(key, ExecutionStatus::Running));

    cache.invalidate(key);
    let after_first = cache.metrics();
    cache.invalidate(key);
    cache.invalidate(key);

    assert_eq!(cache.metrics(), after_first);
    assert_eq!(cache.metrics().invalidations, 1);
}
