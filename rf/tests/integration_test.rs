//! Integration tests for Reqflow
//!
//! These tests drive the scheduler end to end through its public API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyre::eyre;
use proptest::prelude::*;
use reqflow::{
    BatchEntry, BatchOptions, Priority, ProgressReporter, RequestError, RequestOptions, RequestStatus, Scheduler,
    SchedulerConfig,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

fn scheduler(max_concurrent: usize) -> Scheduler<u32> {
    Scheduler::new(SchedulerConfig {
        max_concurrent,
        ..Default::default()
    })
    .expect("valid config")
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Submit an operation that blocks until `gate` is notified
fn spawn_blocked(scheduler: &Scheduler<u32>, key: &'static str, gate: Arc<Notify>) -> JoinHandle<Result<u32, RequestError>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move {
        scheduler
            .submit(
                key,
                move |_p: ProgressReporter| {
                    let gate = gate.clone();
                    async move {
                        gate.notified().await;
                        Ok::<_, eyre::Report>(0)
                    }
                },
                RequestOptions::new(),
            )
            .await
    })
}

/// Submit an operation that records its key when it starts
fn spawn_recording(
    scheduler: &Scheduler<u32>,
    key: &'static str,
    priority: Priority,
    order: Arc<Mutex<Vec<&'static str>>>,
) -> JoinHandle<Result<u32, RequestError>> {
    let scheduler = scheduler.clone();
    tokio::spawn(async move {
        scheduler
            .submit(
                key,
                move |_p: ProgressReporter| {
                    let order = order.clone();
                    async move {
                        order.lock().unwrap().push(key);
                        Ok::<_, eyre::Report>(priority.value() as u32)
                    }
                },
                RequestOptions::new().priority(priority),
            )
            .await
    })
}

fn counting(calls: Arc<AtomicUsize>, value: u32) -> impl Fn(ProgressReporter) -> futures::future::BoxFuture<'static, eyre::Result<u32>> + Send + Sync + 'static {
    move |_p: ProgressReporter| {
        let calls = calls.clone();
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        })
    }
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test]
async fn test_second_submit_within_window_executes_once() {
    let scheduler = scheduler(3);
    let calls = Arc::new(AtomicUsize::new(0));

    let first = scheduler
        .submit("gas:zone-a", counting(calls.clone(), 17), RequestOptions::new())
        .await
        .unwrap();
    let second = scheduler
        .submit("gas:zone-a", counting(calls.clone(), 99), RequestOptions::new())
        .await
        .unwrap();

    assert_eq!(first, 17);
    assert_eq!(second, 17);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cache_expires_after_window() {
    let scheduler = scheduler(3);
    let calls = Arc::new(AtomicUsize::new(0));
    let options = || RequestOptions::new().cache_duration(Duration::from_secs(30));

    scheduler.submit("layout", counting(calls.clone(), 1), options()).await.unwrap();
    tokio::time::advance(Duration::from_secs(29)).await;
    scheduler.submit("layout", counting(calls.clone(), 2), options()).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(2)).await;
    let value = scheduler.submit("layout", counting(calls.clone(), 3), options()).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_freshness_window_belongs_to_the_reader() {
    let scheduler = scheduler(3);
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler
        .submit("route:deck-1", counting(calls.clone(), 1), RequestOptions::new())
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(10)).await;

    // a lenient reader hits, a stricter one refreshes
    let lenient = RequestOptions::new().cache_duration(Duration::from_secs(60));
    assert_eq!(scheduler.submit("route:deck-1", counting(calls.clone(), 2), lenient).await.unwrap(), 1);
    let strict = RequestOptions::new().cache_duration(Duration::from_secs(5));
    assert_eq!(scheduler.submit("route:deck-1", counting(calls.clone(), 3), strict).await.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_force_refresh_bypasses_cache() {
    let scheduler = scheduler(3);
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler.submit("k", counting(calls.clone(), 1), RequestOptions::new()).await.unwrap();
    let value = scheduler
        .submit("k", counting(calls.clone(), 2), RequestOptions::new().force_refresh())
        .await
        .unwrap();

    assert_eq!(value, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failure_keeps_previous_cache_entry() {
    let scheduler = scheduler(3);
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler.submit("gas:zone-b", counting(calls.clone(), 5), RequestOptions::new()).await.unwrap();

    let err = scheduler
        .submit(
            "gas:zone-b",
            |_p: ProgressReporter| async move { Err::<u32, _>(eyre!("sensor offline")) },
            RequestOptions::new().force_refresh(),
        )
        .await
        .unwrap_err();
    assert!(err.is_execution());
    assert!(err.to_string().contains("sensor offline"));

    let status = scheduler.get_status("gas:zone-b");
    assert_eq!(status.status, RequestStatus::Error);
    assert_eq!(status.data, Some(5));
    assert!(status.error.unwrap().is_execution());

    // the old result is still served to a normal read
    let cached = scheduler
        .submit("gas:zone-b", counting(calls.clone(), 6), RequestOptions::new())
        .await
        .unwrap();
    assert_eq!(cached, 5);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Status
// =============================================================================

#[tokio::test]
async fn test_status_round_trip_after_success() {
    let scheduler = scheduler(3);
    let value = scheduler
        .submit("model:upload", |_p: ProgressReporter| async { Ok::<_, eyre::Report>(42) }, RequestOptions::new())
        .await
        .unwrap();

    let status = scheduler.get_status("model:upload");
    assert_eq!(status.status, RequestStatus::Success);
    assert_eq!(status.data, Some(value));
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_unknown_key_is_idle() {
    let scheduler = scheduler(3);
    let status = scheduler.get_status("never-seen");
    assert_eq!(status.status, RequestStatus::Idle);
    assert!(status.data.is_none());
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_pending_while_queued() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());

    let running = spawn_blocked(&scheduler, "running", gate.clone());
    settle().await;
    assert!(scheduler.is_pending("running"));

    gate.notify_one();
    running.await.unwrap().unwrap();
    assert!(!scheduler.is_pending("running"));
}

#[tokio::test]
async fn test_schedulers_are_independent() {
    let a = scheduler(1);
    let b = scheduler(1);

    a.submit("shared-key", |_p: ProgressReporter| async { Ok::<_, eyre::Report>(1) }, RequestOptions::new())
        .await
        .unwrap();

    assert_eq!(a.get_status("shared-key").status, RequestStatus::Success);
    assert_eq!(b.get_status("shared-key").status, RequestStatus::Idle);
}

// =============================================================================
// Priority and admission
// =============================================================================

#[tokio::test]
async fn test_admission_order_by_priority() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = spawn_blocked(&scheduler, "blocker", gate.clone());
    settle().await;

    let mut handles = Vec::new();
    for (key, priority) in [("p1", Priority::Low), ("p3", Priority::High), ("p2", Priority::Normal)] {
        handles.push(spawn_recording(&scheduler, key, priority, order.clone()));
        settle().await;
    }
    assert_eq!(scheduler.queue_state().queued, 3);

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["p3", "p2", "p1"]);
}

#[tokio::test]
async fn test_fifo_within_tier() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = spawn_blocked(&scheduler, "blocker", gate.clone());
    settle().await;

    let mut handles = Vec::new();
    for key in ["first", "second", "third"] {
        handles.push(spawn_recording(&scheduler, key, Priority::Normal, order.clone()));
        settle().await;
    }

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_running_low_priority_is_not_preempted() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let low = spawn_blocked(&scheduler, "low-running", gate.clone());
    settle().await;
    let high = spawn_recording(&scheduler, "high", Priority::High, order.clone());
    settle().await;

    // high waits for the running low-priority operation
    assert!(order.lock().unwrap().is_empty());
    assert_eq!(scheduler.queue_state().running, 1);

    gate.notify_one();
    low.await.unwrap().unwrap();
    high.await.unwrap().unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["high"]);
}

#[tokio::test]
async fn test_duplicate_keys_are_served_independently() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let blocker = spawn_blocked(&scheduler, "blocker", gate.clone());
    settle().await;

    let mut handles = Vec::new();
    for value in [1, 2] {
        let s = scheduler.clone();
        let op = counting(calls.clone(), value);
        handles.push(tokio::spawn(async move { s.submit("dup", op, RequestOptions::new()).await }));
        settle().await;
    }
    assert_eq!(scheduler.queue_state().queued, 2);

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    let results: Vec<u32> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    assert_eq!(results, vec![1, 2]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_rejects_queued_entry() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = spawn_blocked(&scheduler, "blocker", gate.clone());
    settle().await;
    let queued = spawn_recording(&scheduler, "route:deck-2", Priority::Normal, order.clone());
    settle().await;

    assert!(scheduler.cancel("route:deck-2"));
    let err = queued.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(matches!(err, RequestError::Cancelled { ref key } if key == "route:deck-2"));

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    assert!(order.lock().unwrap().is_empty());
    assert_eq!(scheduler.queue_state().queued, 0);
}

#[tokio::test]
async fn test_cancel_running_or_absent_has_no_effect() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());

    let running = spawn_blocked(&scheduler, "running", gate.clone());
    settle().await;

    let before = scheduler.stats();
    assert!(!scheduler.cancel("running"));
    assert!(!scheduler.cancel("absent"));
    assert_eq!(scheduler.stats().total_cancelled, before.total_cancelled);
    assert!(scheduler.is_pending("running"));
    assert_eq!(scheduler.get_status("absent").status, RequestStatus::Idle);

    gate.notify_one();
    assert_eq!(running.await.unwrap().unwrap(), 0);
}

#[tokio::test]
async fn test_cancel_removes_exactly_one_duplicate() {
    let scheduler = scheduler(1);
    let gate = Arc::new(Notify::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let blocker = spawn_blocked(&scheduler, "blocker", gate.clone());
    settle().await;
    let first = spawn_recording(&scheduler, "dup", Priority::Normal, order.clone());
    settle().await;
    let second = spawn_recording(&scheduler, "dup", Priority::Normal, order.clone());
    settle().await;

    assert!(scheduler.cancel("dup"));
    assert_eq!(scheduler.queue_state().queued, 1);
    // the other entry is still waiting, so the key stays pending
    assert!(scheduler.is_pending("dup"));

    gate.notify_one();
    blocker.await.unwrap().unwrap();
    assert!(first.await.unwrap().unwrap_err().is_cancelled());
    assert!(second.await.unwrap().is_ok());
    assert_eq!(order.lock().unwrap().len(), 1);
}

// =============================================================================
// Progress
// =============================================================================

#[tokio::test]
async fn test_progress_forwarded_and_silenced_after_settle() {
    let scheduler = scheduler(1);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let kept: Arc<Mutex<Option<ProgressReporter>>> = Arc::new(Mutex::new(None));

    let sink = seen.clone();
    let stash = kept.clone();
    let value = scheduler
        .submit(
            "model:upload",
            move |progress: ProgressReporter| {
                let stash = stash.clone();
                async move {
                    progress.report(25);
                    progress.report(75);
                    *stash.lock().unwrap() = Some(progress.clone());
                    progress.report(100);
                    Ok::<_, eyre::Report>(1)
                }
            },
            RequestOptions::new().on_progress(move |pct| sink.lock().unwrap().push(pct)),
        )
        .await
        .unwrap();
    assert_eq!(value, 1);

    // a late report from a leaked handle is ignored
    let leaked = kept.lock().unwrap().take().unwrap();
    leaked.report(10);

    assert_eq!(*seen.lock().unwrap(), vec![25, 75, 100]);
    assert_eq!(scheduler.get_status("model:upload").status, RequestStatus::Success);
}

#[tokio::test]
async fn test_progress_without_subscriber() {
    let scheduler = scheduler(1);
    let value = scheduler
        .submit(
            "silent",
            |progress: ProgressReporter| async move {
                progress.report(50);
                Ok::<_, eyre::Report>(3)
            },
            RequestOptions::new(),
        )
        .await
        .unwrap();
    assert_eq!(value, 3);
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn test_retry_requires_recorded_request() {
    let scheduler = scheduler(1);
    let err = scheduler.retry("gas:zone-z").await.unwrap_err();
    assert!(matches!(err, RequestError::NotFound { ref key } if key == "gas:zone-z"));
}

#[tokio::test]
async fn test_retry_bypasses_cache() {
    let scheduler = scheduler(1);
    let calls = Arc::new(AtomicUsize::new(0));

    scheduler.submit("k", counting(calls.clone(), 8), RequestOptions::new()).await.unwrap();
    assert_eq!(scheduler.retry("k").await.unwrap(), 8);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Batch
// =============================================================================

#[tokio::test]
async fn test_batch_partial_failure() {
    let scheduler = scheduler(3);
    let entries: Vec<BatchEntry<u32>> = (1..=5)
        .map(|n| {
            BatchEntry::new(format!("zone-{}", n), move |_p: ProgressReporter| async move {
                if n == 3 {
                    Err(eyre!("zone {} unreachable", n))
                } else {
                    Ok(n * 10)
                }
            })
        })
        .collect();

    let outcomes = scheduler
        .batch(entries, BatchOptions::new().concurrency(2).abort_on_error(false))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 5);
    for (i, outcome) in outcomes.iter().enumerate() {
        let n = i as u32 + 1;
        if n == 3 {
            assert!(!outcome.is_success());
            assert!(outcome.error().unwrap().to_string().contains("zone 3 unreachable"));
        } else {
            assert_eq!(outcome.data(), Some(&(n * 10)));
        }
    }
}

#[tokio::test]
async fn test_batch_abort_on_error() {
    let scheduler = scheduler(3);
    let entries = vec![
        BatchEntry::new("ok", |_p: ProgressReporter| async { Ok::<_, eyre::Report>(1) }),
        BatchEntry::new("bad", |_p: ProgressReporter| async { Err::<u32, _>(eyre!("bad request")) }),
    ];

    let err = scheduler
        .batch(entries, BatchOptions::new().concurrency(2).abort_on_error(true))
        .await
        .unwrap_err();
    assert!(err.is_execution());
}

// =============================================================================
// Rate limiting
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_window_spaces_admissions() {
    let scheduler: Scheduler<u32> = Scheduler::new(SchedulerConfig {
        max_concurrent: 5,
        max_requests_per_window: Some(2),
        rate_window_secs: 10,
        ..Default::default()
    })
    .unwrap();

    let start = tokio::time::Instant::now();
    let mut handles = Vec::new();
    for key in ["a", "b", "c"] {
        let s = scheduler.clone();
        handles.push(tokio::spawn(async move {
            s.submit(key, |_p: ProgressReporter| async { Ok::<_, eyre::Report>(0) }, RequestOptions::new())
                .await
                .map(|_| tokio::time::Instant::now())
        }));
    }

    let finished: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    let late = finished.iter().filter(|t| t.duration_since(start) >= Duration::from_secs(10)).count();
    assert_eq!(late, 1);
    assert!(scheduler.stats().total_rate_limited >= 1);
}

// =============================================================================
// Counter bounds
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_concurrency_never_exceeds_ceiling(
        max_concurrent in 1usize..4,
        outcomes in prop::collection::vec(0u8..3, 1..16),
    ) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (peak, running, completed) = runtime.block_on(async move {
            let scheduler = scheduler(max_concurrent);
            let live = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let mut handles = Vec::new();
            for (i, outcome) in outcomes.iter().copied().enumerate() {
                let s = scheduler.clone();
                let live = live.clone();
                let peak = peak.clone();
                handles.push(tokio::spawn(async move {
                    s.submit(
                        format!("op-{}", i),
                        move |_p: ProgressReporter| {
                            let live = live.clone();
                            let peak = peak.clone();
                            async move {
                                let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::task::yield_now().await;
                                live.fetch_sub(1, Ordering::SeqCst);
                                match outcome {
                                    0 => Ok::<_, eyre::Report>(i as u32),
                                    1 => Err(eyre!("failed")),
                                    _ => panic!("operation blew up"),
                                }
                            }
                        },
                        RequestOptions::new(),
                    )
                    .await
                }));
            }

            let completed = futures::future::join_all(handles).await.len();
            (peak.load(Ordering::SeqCst), scheduler.queue_state().running, completed)
        });

        prop_assert!(peak <= max_concurrent);
        prop_assert_eq!(running, 0);
        prop_assert!(completed > 0);
    }
}
