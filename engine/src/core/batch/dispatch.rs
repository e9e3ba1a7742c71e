//! Concurrency Controller
//!
//! Drives one job from `pending` to a terminal status. Items are started in
//! submission order, at most `max_concurrent` at a time; completion order is
//! whatever order the work functions finish in. A failed item never stops
//! the job. Cancellation stops new dispatches and lets in-flight items drain.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use super::scheduler::{ActiveJob, SchedulerShared};
use super::{BatchEvent, JobStatus, WorkFunction};

type ItemOutcome = Result<serde_json::Value, String>;

/// Runs the job to completion and moves it to history
pub(crate) async fn drive_job(
    shared: Arc<SchedulerShared>,
    active: Arc<ActiveJob>,
    work: Arc<dyn WorkFunction>,
) {
    let job = &active.job;

    if !active.cancel.is_cancelled() {
        if let Err(error) = work.prepare(&job.options).await {
            if active.progress.lock().fail_to_start(error.clone()) {
                warn!(job_id = %job.id, operation = %job.operation, "Batch job failed to start: {}", error);
                finish(&shared, &active).await;
                return;
            }
        }
    }

    if active.progress.lock().transition(JobStatus::Running) {
        info!(
            job_id = %job.id,
            operation = %job.operation,
            items = job.total(),
            max_concurrent = job.max_concurrent,
            "Batch job started"
        );
        shared.events.emit(BatchEvent::JobStarted {
            job_id: job.id.clone(),
        });
    }

    let mut cursor = 0usize;
    let mut tasks: JoinSet<(usize, ItemOutcome)> = JoinSet::new();

    loop {
        'fill: while tasks.len() < job.max_concurrent
            && cursor < job.total()
            && !active.cancel.is_cancelled()
        {
            let permit = match &shared.budget {
                None => None,
                Some(budget) => {
                    let acquire = budget.acquire(job.priority);
                    tokio::pin!(acquire);
                    // Keeps the queue position while finished items are recorded
                    loop {
                        tokio::select! {
                            biased;
                            _ = active.cancel.cancelled() => break 'fill,
                            permit = &mut acquire => break match permit {
                                Ok(permit) => Some(permit),
                                Err(e) => {
                                    warn!(job_id = %job.id, "Dispatching without global permit: {}", e);
                                    None
                                }
                            },
                            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                                record_outcome(&shared, &active, joined);
                            }
                        }
                    }
                }
            };

            let index = cursor;
            let item_id = job.item_ids[index].clone();
            {
                let mut progress = active.progress.lock();
                // Cancel may have landed while waiting for a permit
                if progress.status() != JobStatus::Running {
                    break 'fill;
                }
                progress.mark_dispatched(index, &item_id);
            }
            cursor += 1;

            debug!(job_id = %job.id, item_id = %item_id, index, "Dispatching item");
            shared.events.emit(BatchEvent::ItemStarted {
                job_id: job.id.clone(),
                item_id: item_id.clone(),
                index,
            });

            let work = Arc::clone(&work);
            let options = job.options.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let outcome = AssertUnwindSafe(work.execute(&item_id, &options))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err("work function panicked".to_string()));
                (index, outcome)
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        record_outcome(&shared, &active, joined);
    }

    finish(&shared, &active).await;
}

/// Folds one finished item into progress and announces it
fn record_outcome(
    shared: &SchedulerShared,
    active: &ActiveJob,
    joined: Result<(usize, ItemOutcome), JoinError>,
) {
    let job = &active.job;
    let (index, outcome) = match joined {
        Ok(done) => done,
        Err(e) => {
            warn!(job_id = %job.id, "Item task ended unexpectedly: {}", e);
            return;
        }
    };

    let event = {
        let mut progress = active.progress.lock();
        let Some(result) = progress.record(index, outcome) else {
            return;
        };
        let (item_id, success) = (result.item_id.clone(), result.success);
        if let Some(error) = &result.error {
            debug!(job_id = %job.id, item_id = %item_id, "Item failed: {}", error);
        }
        BatchEvent::ItemFinished {
            job_id: job.id.clone(),
            item_id,
            index,
            success,
            progress: progress.snapshot(job),
        }
    };
    shared.events.emit(event);
}

/// Terminal transition: build the record, move it to history, wake waiters
async fn finish(shared: &Arc<SchedulerShared>, active: &ActiveJob) {
    let job = &active.job;

    let record = {
        let mut progress = active.progress.lock();
        let orphans = progress.fail_in_flight("work task ended unexpectedly");
        if orphans > 0 {
            warn!(job_id = %job.id, orphans, "Recorded orphaned items as failed");
        }

        match progress.status() {
            JobStatus::Running => {
                progress.transition(JobStatus::Completed);
            }
            JobStatus::Cancelling => {
                progress.transition(JobStatus::Cancelled);
            }
            _ => {}
        }
        progress.to_record(job)
    };

    info!(
        job_id = %job.id,
        status = %record.status,
        succeeded = record.success_count,
        failed = record.failure_count,
        skipped = record.skipped_count,
        elapsed_ms = record.execution_time_ms,
        "Batch job finished"
    );

    let event = BatchEvent::JobFinished {
        job_id: job.id.clone(),
        status: record.status,
        success_count: record.success_count,
        failure_count: record.failure_count,
        skipped_count: record.skipped_count,
    };

    // One critical section: readers see the job either active or in history
    let write = {
        let mut jobs = shared.active.write();
        let write = shared.history.push(record);
        jobs.remove(&job.id);
        write
    };

    // Journal I/O stays off the locks and off the runtime threads
    if write.is_pending() {
        let shared = Arc::clone(shared);
        if let Err(e) = tokio::task::spawn_blocking(move || shared.history.persist(write)).await {
            warn!(job_id = %job.id, "History journal task failed: {}", e);
        }
    }
    active.done_tx.send_replace(true);
    shared.events.emit(event);
}
