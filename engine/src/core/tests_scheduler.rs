//! Scheduler Scenario Tests
//!
//! End-to-end behavior of the batch scheduler with real job drivers:
//! concurrency bounds, cancellation, failure isolation, history and events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::{broadcast, Semaphore};

use crate::core::batch::{
    BatchEvent, BatchRequest, BatchScheduler, FnWork, JobStats, JobStatus, OperationKind,
    OperationRegistry, Priority, WorkFunction,
};
use crate::core::settings::BatchSettings;
use crate::core::CoreError;

// =============================================================================
// Helpers
// =============================================================================

fn clips(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("clip-{i}")).collect()
}

fn scheduler(kind: OperationKind, work: impl WorkFunction + 'static) -> BatchScheduler {
    scheduler_with(kind, work, BatchSettings::default())
}

fn scheduler_with(
    kind: OperationKind,
    work: impl WorkFunction + 'static,
    settings: BatchSettings,
) -> BatchScheduler {
    let registry = OperationRegistry::builder()
        .register(kind, "test operation", work)
        .build();
    BatchScheduler::new(registry, settings)
}

/// Work function that blocks until the gate has a permit for it
struct Gated {
    gate: Arc<Semaphore>,
    started: Arc<AtomicUsize>,
}

impl Gated {
    fn new() -> Self {
        Self {
            gate: Arc::new(Semaphore::new(0)),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl WorkFunction for Gated {
    async fn execute(&self, item_id: &str, _options: &Value) -> Result<Value, String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let permit = self.gate.acquire().await.map_err(|e| e.to_string())?;
        permit.forget();
        Ok(json!({ "item": item_id }))
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Collects events of one job up to and including its `JobFinished`
async fn collect_events(rx: &mut broadcast::Receiver<BatchEvent>, job_id: &str) -> Vec<BatchEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event stream closed");
            if event.job_id() != job_id {
                continue;
            }
            let finished = matches!(event, BatchEvent::JobFinished { .. });
            events.push(event);
            if finished {
                break;
            }
        }
    })
    .await
    .expect("job did not finish in time");
    events
}

fn event_names(events: &[BatchEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

// =============================================================================
// Happy path & failures
// =============================================================================

#[tokio::test]
async fn test_transcription_batch_completes() {
    let scheduler = scheduler(
        OperationKind::WhisperTranscription,
        FnWork::new(|item: String, opts: Value| async move {
            Ok::<_, String>(json!({ "clip": item, "language": opts.get("language").cloned() }))
        }),
    );
    let mut rx = scheduler.subscribe();

    let job_id = scheduler
        .submit(
            BatchRequest::new(OperationKind::WhisperTranscription, ["c1", "c2", "c3"])
                .with_options(json!({ "language": "en" }))
                .with_max_concurrent(2),
        )
        .unwrap();

    let events = collect_events(&mut rx, &job_id).await;
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.total_items, 3);
    assert_eq!(record.total_processed, 3);
    assert_eq!(record.success_count, 3);
    assert_eq!(record.failure_count, 0);
    assert!(record.errors.is_empty());
    assert!(record.started_at.is_some());
    assert_eq!(record.results[0].payload.as_ref().unwrap()["language"], "en");

    let names = event_names(&events);
    assert_eq!(names.first(), Some(&"batch:queued"));
    assert_eq!(names[1], "batch:started");
    assert_eq!(names.last(), Some(&"batch:finished"));
    assert_eq!(names.iter().filter(|n| **n == "batch:item-started").count(), 3);
    assert_eq!(names.iter().filter(|n| **n == "batch:item-finished").count(), 3);
}

#[tokio::test]
async fn test_partial_failure_does_not_abort_job() {
    let scheduler = scheduler(
        OperationKind::QualityAnalysis,
        FnWork::new(|item: String, _opts: Value| async move {
            if item.starts_with("bad") {
                Err(format!("cannot decode {item}"))
            } else {
                Ok(json!({ "score": 0.8 }))
            }
        }),
    );

    let job_id = scheduler
        .submit(BatchRequest::new(
            OperationKind::QualityAnalysis,
            ["ok-0", "bad-1", "ok-2", "bad-3", "ok-4"],
        ))
        .unwrap();
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.success_count, 3);
    assert_eq!(record.failure_count, 2);
    assert_eq!(record.results.len(), 5);
    assert_eq!(record.errors.len(), 2);
    assert!(record.errors.contains(&"bad-1: cannot decode bad-1".to_string()));

    for result in &record.results {
        assert_eq!(result.success, result.error.is_none());
        assert_eq!(result.success, result.payload.is_some());
    }
}

#[tokio::test]
async fn test_panicking_item_is_recorded_as_failure() {
    let scheduler = scheduler(
        OperationKind::ColorAnalysis,
        FnWork::new(|item: String, _opts: Value| async move {
            if item == "boom" {
                panic!("corrupt frame");
            }
            Ok::<_, String>(json!("ok"))
        }),
    );

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::ColorAnalysis, ["a", "boom", "b"]))
        .unwrap();
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.success_count, 2);
    assert_eq!(record.failure_count, 1);
    assert_eq!(record.errors, vec!["boom: work function panicked"]);
}

#[tokio::test]
async fn test_duplicate_item_ids_processed_independently() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let scheduler = scheduler(
        OperationKind::SceneDetection,
        FnWork::new(move |_item: String, _opts: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(Value::Null) }
        }),
    );

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["same", "same"]))
        .unwrap();
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let mut indices: Vec<usize> = record.results.iter().map(|r| r.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1]);
}

// =============================================================================
// Concurrency
// =============================================================================

/// Runs 24 items with seeded random latencies; returns the peak in-flight count
async fn run_with_random_latencies(seed: u64, max_concurrent: usize) -> usize {
    let mut rng = StdRng::seed_from_u64(seed);
    let latencies: HashMap<String, u64> = clips(24)
        .into_iter()
        .map(|id| (id, rng.gen_range(1..15)))
        .collect();
    let latencies = Arc::new(latencies);

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (cur, max) = (Arc::clone(&current), Arc::clone(&peak));

    let scheduler = scheduler(
        OperationKind::SceneDetection,
        FnWork::new(move |item: String, _opts: Value| {
            let (cur, max, latencies) = (Arc::clone(&cur), Arc::clone(&max), Arc::clone(&latencies));
            async move {
                let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                max.fetch_max(now, Ordering::SeqCst);
                let delay = latencies.get(&item).copied().unwrap_or(1);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                cur.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(json!(delay))
            }
        }),
    );

    let job_id = scheduler
        .submit(
            BatchRequest::new(OperationKind::SceneDetection, clips(24))
                .with_max_concurrent(max_concurrent),
        )
        .unwrap();
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.total_processed, 24);
    assert_eq!(record.success_count + record.failure_count, record.total_items);
    assert_eq!(current.load(Ordering::SeqCst), 0);
    peak.load(Ordering::SeqCst)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_in_flight_never_exceeds_limit() {
    for (seed, limit) in [(7, 1), (42, 3), (1234, 4), (99, 8)] {
        let peak = run_with_random_latencies(seed, limit).await;
        assert!(peak <= limit, "seed {seed}: peak {peak} > limit {limit}");
        assert!(peak >= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_limit_is_reached_when_items_outnumber_it() {
    assert_eq!(run_with_random_latencies(5, 4).await, 4);
}

#[tokio::test]
async fn test_processed_order_may_differ_from_submission_order() {
    let scheduler = scheduler(
        OperationKind::SceneDetection,
        FnWork::new(|item: String, _opts: Value| async move {
            let delay = match item.as_str() {
                "slow" => 90,
                "medium" => 45,
                _ => 0,
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok::<_, String>(json!(delay))
        }),
    );
    let mut rx = scheduler.subscribe();

    let job_id = scheduler
        .submit(
            BatchRequest::new(OperationKind::SceneDetection, ["slow", "medium", "fast"])
                .with_max_concurrent(3),
        )
        .unwrap();
    let events = collect_events(&mut rx, &job_id).await;
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    let started: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            BatchEvent::ItemStarted { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![0, 1, 2]);

    let finished: Vec<&str> = record.results.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(finished, vec!["fast", "medium", "slow"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_progress_reads_are_consistent() {
    let scheduler = scheduler(
        OperationKind::LanguageDetection,
        FnWork::new(|item: String, _opts: Value| async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            if item.ends_with('7') {
                Err("silent track".to_string())
            } else {
                Ok(json!("en"))
            }
        }),
    );

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::LanguageDetection, clips(40)).with_max_concurrent(5))
        .unwrap();

    let mut readers = Vec::new();
    for _ in 0..4 {
        let scheduler = scheduler.clone();
        let job_id = job_id.clone();
        readers.push(tokio::spawn(async move {
            let mut last_processed = 0;
            loop {
                let snap = scheduler.get_progress(&job_id).expect("job must stay visible");
                assert_eq!(snap.succeeded + snap.failed, snap.processed);
                assert!(snap.processed <= snap.total);
                assert!(snap.in_flight_item_ids.len() <= 5);
                assert!(snap.processed + snap.in_flight_item_ids.len() <= snap.total);
                assert!(snap.processed >= last_processed);
                last_processed = snap.processed;
                if snap.status.is_terminal() {
                    return snap;
                }
                tokio::task::yield_now().await;
            }
        }));
    }

    for reader in readers {
        let last = reader.await.unwrap();
        assert_eq!(last.status, JobStatus::Completed);
        assert_eq!(last.processed, 40);
        assert_eq!(last.failed, 4);
        assert_eq!(last.percentage, 1.0);
    }
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_drains_in_flight_and_skips_pending() {
    let work = Gated::new();
    let (gate, started) = (Arc::clone(&work.gate), Arc::clone(&work.started));
    let scheduler = scheduler(OperationKind::PlatformEncoding, work);

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::PlatformEncoding, clips(10)).with_max_concurrent(3))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 3).await;

    assert!(scheduler.cancel(&job_id));
    assert!(!scheduler.cancel(&job_id), "second cancel is a no-op");

    let snap = scheduler.get_progress(&job_id).unwrap();
    assert_eq!(snap.status, JobStatus::Cancelling);
    assert_eq!(snap.in_flight_item_ids, vec!["clip-0", "clip-1", "clip-2"]);
    assert_eq!(snap.skipped, 7);

    gate.add_permits(10);
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::Cancelled);
    assert_eq!(record.results.len(), 3);
    assert_eq!(record.success_count, 3);
    assert_eq!(record.skipped_count, 7);
    assert_eq!(record.total_processed + record.skipped_count, record.total_items);
    assert_eq!(started.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_cancel_before_start_runs_nothing() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let scheduler = scheduler(
        OperationKind::SubtitleGeneration,
        FnWork::new(move |_item: String, _opts: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, String>(Value::Null) }
        }),
    );
    let mut rx = scheduler.subscribe();

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::SubtitleGeneration, clips(4)))
        .unwrap();
    // The driver has not been polled yet on this single-threaded runtime
    assert_eq!(scheduler.get_progress(&job_id).unwrap().status, JobStatus::Pending);
    assert!(scheduler.cancel(&job_id));

    let events = collect_events(&mut rx, &job_id).await;
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(
        event_names(&events),
        vec!["batch:queued", "batch:cancelling", "batch:finished"]
    );
    assert_eq!(record.status, JobStatus::Cancelled);
    assert!(record.results.is_empty());
    assert_eq!(record.skipped_count, 4);
    assert!(record.started_at.is_none());
    assert_eq!(record.execution_time_ms, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_cancel_finished_job_returns_false() {
    let scheduler = scheduler(
        OperationKind::SceneDetection,
        FnWork::new(|_item: String, _opts: Value| async { Ok::<_, String>(Value::Null) }),
    );
    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["a"]))
        .unwrap();
    scheduler.wait_for_completion(&job_id).await.unwrap();

    assert!(!scheduler.cancel(&job_id));
    assert_eq!(
        scheduler.get_history(&job_id).unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn test_cancel_all_cancels_every_active_job() {
    let work = Gated::new();
    let (gate, started) = (Arc::clone(&work.gate), Arc::clone(&work.started));
    let scheduler = scheduler(OperationKind::SceneDetection, work);

    let first = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, clips(3)).with_max_concurrent(1))
        .unwrap();
    let second = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, clips(3)).with_max_concurrent(1))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 2).await;

    assert_eq!(scheduler.active_jobs().len(), 2);
    assert_eq!(scheduler.cancel_all(), 2);
    assert_eq!(scheduler.cancel_all(), 0);

    gate.add_permits(10);
    for job_id in [first, second] {
        let record = scheduler.wait_for_completion(&job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert_eq!(record.results.len(), 1);
        assert_eq!(record.skipped_count, 2);
    }
}

// =============================================================================
// Preconditions
// =============================================================================

struct NeedsModel {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl WorkFunction for NeedsModel {
    async fn execute(&self, _item_id: &str, _options: &Value) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "text": "hello" }))
    }

    async fn prepare(&self, options: &Value) -> Result<(), String> {
        match options.get("model").and_then(Value::as_str) {
            Some(_) => Ok(()),
            None => Err("whisper model not configured".to_string()),
        }
    }
}

#[tokio::test]
async fn test_failed_precondition_moves_job_to_history() {
    let calls = Arc::new(AtomicUsize::new(0));
    let scheduler = scheduler(
        OperationKind::WhisperTranscription,
        NeedsModel {
            calls: Arc::clone(&calls),
        },
    );
    let mut rx = scheduler.subscribe();

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::WhisperTranscription, clips(3)))
        .unwrap();
    let events = collect_events(&mut rx, &job_id).await;
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();

    assert_eq!(record.status, JobStatus::FailedToStart);
    assert_eq!(record.errors, vec!["whisper model not configured"]);
    assert!(record.results.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(!event_names(&events).contains(&"batch:started"));
    assert_eq!(scheduler.get_stats().failed_to_start_jobs, 1);

    let job_id = scheduler
        .submit(
            BatchRequest::new(OperationKind::WhisperTranscription, clips(2))
                .with_options(json!({ "model": "base.en" })),
        )
        .unwrap();
    let record = scheduler.wait_for_completion(&job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Admission limits
// =============================================================================

#[tokio::test]
async fn test_max_active_jobs_rejects_excess_submissions() {
    let work = Gated::new();
    let gate = Arc::clone(&work.gate);
    let settings = BatchSettings {
        max_active_jobs: 1,
        ..Default::default()
    };
    let scheduler = scheduler_with(OperationKind::SceneDetection, work, settings);

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["a"]))
        .unwrap();
    let err = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["b"]))
        .unwrap_err();
    assert!(matches!(err, CoreError::ResourceExhausted(_)));

    gate.add_permits(1);
    scheduler.wait_for_completion(&job_id).await.unwrap();

    gate.add_permits(1);
    let next = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["b"]))
        .unwrap();
    scheduler.wait_for_completion(&next).await.unwrap();
}

#[tokio::test]
async fn test_global_budget_admits_higher_priority_first() {
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));
    let (blocker_gate, log) = (Arc::clone(&gate), Arc::clone(&order));

    let scheduler = scheduler_with(
        OperationKind::PlatformEncoding,
        FnWork::new(move |item: String, _opts: Value| {
            let (gate, log) = (Arc::clone(&blocker_gate), Arc::clone(&log));
            async move {
                log.lock().push(item.clone());
                if item == "blocker" {
                    gate.acquire().await.map_err(|e| e.to_string())?.forget();
                }
                Ok::<_, String>(Value::Null)
            }
        }),
        BatchSettings::default().with_global_max_concurrent(1),
    );
    let budget = scheduler.global_budget().unwrap().clone();

    let blocker = scheduler
        .submit(BatchRequest::new(OperationKind::PlatformEncoding, ["blocker"]))
        .unwrap();
    wait_until(|| order.lock().len() == 1).await;

    let low = scheduler
        .submit(BatchRequest::new(OperationKind::PlatformEncoding, ["low"]).with_priority(Priority::Low))
        .unwrap();
    wait_until(|| budget.waiting() == 1).await;
    let high = scheduler
        .submit(BatchRequest::new(OperationKind::PlatformEncoding, ["high"]).with_priority(Priority::High))
        .unwrap();
    wait_until(|| budget.waiting() == 2).await;

    gate.add_permits(1);
    for job_id in [blocker, low, high] {
        scheduler.wait_for_completion(&job_id).await.unwrap();
    }

    assert_eq!(*order.lock(), vec!["blocker", "high", "low"]);
    assert_eq!(budget.available(), 1);
}

#[tokio::test]
async fn test_cancel_stops_waiting_for_global_budget() {
    let work = Gated::new();
    let (gate, started) = (Arc::clone(&work.gate), Arc::clone(&work.started));
    let scheduler = scheduler_with(
        OperationKind::SceneDetection,
        work,
        BatchSettings::default().with_global_max_concurrent(1),
    );
    let budget = scheduler.global_budget().unwrap().clone();

    let holder = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["held"]))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;
    let waiter = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, clips(2)))
        .unwrap();
    wait_until(|| budget.waiting() == 1).await;

    assert!(scheduler.cancel(&waiter));
    let record = scheduler.wait_for_completion(&waiter).await.unwrap();
    assert_eq!(record.status, JobStatus::Cancelled);
    assert!(record.results.is_empty());
    assert_eq!(record.skipped_count, 2);

    gate.add_permits(1);
    scheduler.wait_for_completion(&holder).await.unwrap();
    assert_eq!(budget.available(), 1);
}

#[tokio::test]
async fn test_items_finishing_while_waiting_for_budget_are_recorded() {
    let clip_gate = Arc::new(Semaphore::new(0));
    let hold_gate = Arc::new(Semaphore::new(0));
    let (clip, hold) = (Arc::clone(&clip_gate), Arc::clone(&hold_gate));

    let scheduler = scheduler_with(
        OperationKind::QualityAnalysis,
        FnWork::new(move |item: String, _opts: Value| {
            let gate = match item.as_str() {
                "a0" => Some(Arc::clone(&clip)),
                "h0" => Some(Arc::clone(&hold)),
                _ => None,
            };
            async move {
                if let Some(gate) = gate {
                    gate.acquire().await.map_err(|e| e.to_string())?.forget();
                }
                Ok::<_, String>(json!({ "item": item }))
            }
        }),
        BatchSettings::default().with_global_max_concurrent(1),
    );
    let budget = scheduler.global_budget().unwrap().clone();

    let low = scheduler
        .submit(
            BatchRequest::new(OperationKind::QualityAnalysis, ["a0", "a1"])
                .with_priority(Priority::Low)
                .with_max_concurrent(2),
        )
        .unwrap();
    wait_until(|| budget.waiting() == 1).await;
    let high = scheduler
        .submit(BatchRequest::new(OperationKind::QualityAnalysis, ["h0"]).with_priority(Priority::High))
        .unwrap();
    wait_until(|| budget.waiting() == 2).await;

    // a0 hands its permit to the high-priority job; `low` keeps waiting
    clip_gate.add_permits(1);
    wait_until(|| scheduler.get_progress(&low).unwrap().processed == 1).await;

    let progress = scheduler.get_progress(&low).unwrap();
    assert_eq!(progress.status, JobStatus::Running);
    assert_eq!(progress.succeeded, 1);
    assert!(progress.in_flight_item_ids.is_empty());
    assert_eq!(budget.waiting(), 1);
    wait_until(|| scheduler.get_progress(&high).unwrap().in_flight_item_ids == vec!["h0"]).await;

    hold_gate.add_permits(1);
    let record = scheduler.wait_for_completion(&low).await.unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.success_count, 2);
    scheduler.wait_for_completion(&high).await.unwrap();
    assert_eq!(budget.available(), 1);
}

// =============================================================================
// History & stats
// =============================================================================

#[tokio::test]
async fn test_history_records_are_immutable_snapshots() {
    let scheduler = scheduler(
        OperationKind::SceneDetection,
        FnWork::new(|_item: String, _opts: Value| async { Ok::<_, String>(json!(1)) }),
    );

    let first = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["a", "b"]))
        .unwrap();
    scheduler.wait_for_completion(&first).await.unwrap();

    let mut copy = scheduler.list_history(None).remove(0);
    let original = copy.clone();
    copy.results.clear();
    copy.status = JobStatus::Cancelled;

    let second = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["c"]))
        .unwrap();
    scheduler.wait_for_completion(&second).await.unwrap();

    assert_eq!(scheduler.get_history(&first).unwrap(), original);

    let history = scheduler.list_history(None);
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].job_id, second, "newest first");
    assert_eq!(scheduler.list_history(Some(1)).len(), 1);
}

#[tokio::test]
async fn test_stats_clear_and_trim() {
    let scheduler = scheduler(
        OperationKind::QualityAnalysis,
        FnWork::new(|item: String, _opts: Value| async move {
            if item == "bad" {
                Err("clipped audio".to_string())
            } else {
                Ok(json!("ok"))
            }
        }),
    );

    for items in [vec!["a", "bad"], vec!["b"], vec!["c", "d"]] {
        let job_id = scheduler
            .submit(BatchRequest::new(OperationKind::QualityAnalysis, items))
            .unwrap();
        scheduler.wait_for_completion(&job_id).await.unwrap();
    }

    let stats = scheduler.get_stats();
    assert_eq!(stats.total_jobs, 3);
    assert_eq!(stats.completed_jobs, 3);
    assert_eq!(stats.total_succeeded, 4);
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.active_jobs, 0);

    assert_eq!(scheduler.trim_history(1), 2);
    assert_eq!(scheduler.list_history(None).len(), 1);

    assert_eq!(scheduler.clear_history(), 1);
    assert_eq!(scheduler.get_stats(), JobStats::default());
}

#[tokio::test]
async fn test_clear_history_leaves_active_jobs_alone() {
    let work = Gated::new();
    let (gate, started) = (Arc::clone(&work.gate), Arc::clone(&work.started));
    let scheduler = scheduler(OperationKind::SceneDetection, work);

    let job_id = scheduler
        .submit(BatchRequest::new(OperationKind::SceneDetection, ["a"]))
        .unwrap();
    wait_until(|| started.load(Ordering::SeqCst) == 1).await;

    assert_eq!(scheduler.clear_history(), 0);
    let stats = scheduler.get_stats();
    assert_eq!(stats.active_jobs, 1);
    assert_eq!(stats.total_jobs, 1);
    assert_eq!(
        scheduler.get_progress(&job_id).unwrap().status,
        JobStatus::Running
    );

    gate.add_permits(1);
    scheduler.wait_for_completion(&job_id).await.unwrap();
    assert_eq!(scheduler.get_stats().completed_jobs, 1);
}

#[tokio::test]
async fn test_history_limit_drops_oldest() {
    let scheduler = scheduler_with(
        OperationKind::SceneDetection,
        FnWork::new(|_item: String, _opts: Value| async { Ok::<_, String>(Value::Null) }),
        BatchSettings {
            history_limit: 2,
            ..Default::default()
        },
    );

    let mut ids = Vec::new();
    for _ in 0..3 {
        let job_id = scheduler
            .submit(BatchRequest::new(OperationKind::SceneDetection, ["x"]))
            .unwrap();
        scheduler.wait_for_completion(&job_id).await.unwrap();
        ids.push(job_id);
    }

    let history: Vec<String> = scheduler
        .list_history(None)
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(history, vec![ids[2].clone(), ids[1].clone()]);
    assert!(scheduler.get_progress(&ids[0]).is_none());
}

#[tokio::test]
async fn test_history_journal_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let settings = BatchSettings::default().with_history_path(temp_dir.path().join("history.jsonl"));
    let work = || FnWork::new(|item: String, _opts: Value| async move { Ok::<_, String>(json!(item)) });

    let job_id = {
        let scheduler = scheduler_with(OperationKind::SceneDetection, work(), settings.clone());
        let job_id = scheduler
            .submit(BatchRequest::new(OperationKind::SceneDetection, ["a", "b"]))
            .unwrap();
        scheduler.wait_for_completion(&job_id).await.unwrap();
        job_id
    };

    let reopened = scheduler_with(OperationKind::SceneDetection, work(), settings.clone());
    let record = reopened.get_history(&job_id).unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.results.len(), 2);

    assert_eq!(reopened.clear_history(), 1);
    let reopened = scheduler_with(OperationKind::SceneDetection, work(), settings);
    assert!(reopened.list_history(None).is_empty());
}
