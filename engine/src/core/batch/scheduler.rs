//! Batch Scheduler
//!
//! Public facade: admits jobs, answers progress and history queries, and
//! forwards cancel requests. Each admitted job gets its own driver task
//! (see `dispatch`); the scheduler itself never blocks on item work.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::dispatch::drive_job;
use super::progress::JobProgress;
use super::{
    BatchEvent, BatchJob, BatchRequest, EventBus, GlobalBudget, HistoryJournal, HistoryStore,
    JobHistoryRecord, JobStats, JobStatus, OperationInfo, OperationRegistry, ProgressSnapshot,
};
use crate::core::settings::BatchSettings;
use crate::core::{CoreError, CoreResult, JobId};

// =============================================================================
// Shared State
// =============================================================================

/// A job that has not yet moved to history
pub(crate) struct ActiveJob {
    pub(crate) job: BatchJob,
    pub(crate) progress: Mutex<JobProgress>,
    pub(crate) cancel: CancellationToken,
    /// Flips to true once the history record exists
    pub(crate) done_tx: watch::Sender<bool>,
}

impl ActiveJob {
    fn new(job: BatchJob) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            job,
            progress: Mutex::new(JobProgress::new()),
            cancel: CancellationToken::new(),
            done_tx,
        }
    }

    fn snapshot(&self) -> ProgressSnapshot {
        self.progress.lock().snapshot(&self.job)
    }
}

/// State shared between the scheduler handle and job drivers
pub(crate) struct SchedulerShared {
    pub(crate) registry: OperationRegistry,
    pub(crate) settings: BatchSettings,
    /// Lock order: `active` before the history lock
    pub(crate) active: RwLock<HashMap<JobId, Arc<ActiveJob>>>,
    pub(crate) history: HistoryStore,
    pub(crate) events: EventBus,
    pub(crate) budget: Option<GlobalBudget>,
}

// =============================================================================
// Scheduler
// =============================================================================

/// Batch operation scheduler
///
/// Cheap to clone; all clones share the same jobs and history. `submit`
/// spawns the job driver and fails outside a tokio runtime.
#[derive(Clone)]
pub struct BatchScheduler {
    shared: Arc<SchedulerShared>,
}

impl std::fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("operations", &self.shared.registry.len())
            .field("active_jobs", &self.shared.active.read().len())
            .field("history", &self.shared.history.len())
            .finish()
    }
}

impl BatchScheduler {
    /// Creates a scheduler; loads the history journal when one is configured
    pub fn new(registry: OperationRegistry, settings: BatchSettings) -> Self {
        let mut settings = settings;
        settings.normalize();

        let history = match &settings.history_path {
            Some(path) => {
                HistoryStore::with_journal(settings.history_limit, HistoryJournal::new(path))
            }
            None => HistoryStore::in_memory(settings.history_limit),
        };

        let budget = (settings.global_max_concurrent > 0)
            .then(|| GlobalBudget::new(settings.global_max_concurrent));

        info!(
            operations = registry.len(),
            default_max_concurrent = settings.default_max_concurrent,
            global_max_concurrent = settings.global_max_concurrent,
            history = history.len(),
            "Batch scheduler initialized"
        );

        Self {
            shared: Arc::new(SchedulerShared {
                registry,
                events: EventBus::new(settings.event_capacity),
                settings,
                active: RwLock::new(HashMap::new()),
                history,
                budget,
            }),
        }
    }

    /// Effective (normalized) settings
    pub fn settings(&self) -> &BatchSettings {
        &self.shared.settings
    }

    /// Process-wide budget, when `global_max_concurrent` is set
    pub fn global_budget(&self) -> Option<&GlobalBudget> {
        self.shared.budget.as_ref()
    }

    /// Registered operations
    pub fn operations(&self) -> Vec<OperationInfo> {
        self.shared.registry.infos()
    }

    /// Receives lifecycle events of every job
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.shared.events.subscribe()
    }

    /// Validates and admits a job, returning its ID immediately
    ///
    /// Nothing is registered when validation fails. Job-level preconditions
    /// checked by the work function surface later as `failed_to_start`.
    pub fn submit(&self, request: BatchRequest) -> CoreResult<JobId> {
        if request.item_ids.is_empty() {
            return Err(CoreError::EmptyBatch);
        }
        let Some(descriptor) = self.shared.registry.get(&request.operation) else {
            return Err(CoreError::UnknownOperation(request.operation.to_string()));
        };
        if request.max_concurrent == Some(0) {
            return Err(CoreError::InvalidConcurrency(0));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CoreError::Internal(format!("submit needs a tokio runtime: {e}")))?;

        let work = Arc::clone(&descriptor.work);
        let job = BatchJob::from_request(request, self.shared.settings.default_max_concurrent);
        let job_id = job.id.clone();
        let queued = BatchEvent::JobQueued {
            job_id: job_id.clone(),
            operation: job.operation.clone(),
            total: job.total(),
        };

        let active = Arc::new(ActiveJob::new(job));
        {
            let mut jobs = self.shared.active.write();
            let limit = self.shared.settings.max_active_jobs;
            if limit > 0 && jobs.len() >= limit {
                return Err(CoreError::ResourceExhausted(format!(
                    "{} active jobs (limit {})",
                    jobs.len(),
                    limit
                )));
            }
            jobs.insert(job_id.clone(), Arc::clone(&active));
        }

        info!(
            job_id = %job_id,
            operation = %active.job.operation,
            items = active.job.total(),
            priority = ?active.job.priority,
            max_concurrent = active.job.max_concurrent,
            "Batch job queued"
        );
        self.shared.events.emit(queued);

        runtime.spawn(drive_job(Arc::clone(&self.shared), active, work));
        Ok(job_id)
    }

    fn active_job(&self, job_id: &str) -> Option<Arc<ActiveJob>> {
        self.shared.active.read().get(job_id).cloned()
    }

    /// Current progress of an active or historical job
    pub fn get_progress(&self, job_id: &str) -> Option<ProgressSnapshot> {
        if let Some(active) = self.active_job(job_id) {
            return Some(active.snapshot());
        }
        // Records land in history before leaving the active set
        self.shared.history.snapshot(job_id)
    }

    /// Requests cancellation; false if the job is unknown, terminal or already cancelling
    pub fn cancel(&self, job_id: &str) -> bool {
        let Some(active) = self.active_job(job_id) else {
            debug!(job_id, "Cancel ignored: job not active");
            return false;
        };

        let mut progress = active.progress.lock();
        if !progress.status().is_cancellable() {
            debug!(job_id, status = %progress.status(), "Cancel ignored");
            return false;
        }
        progress.transition(JobStatus::Cancelling);
        active.cancel.cancel();
        info!(
            job_id,
            in_flight = progress.in_flight_len(),
            "Batch job cancelling"
        );
        // Emitted under the lock so it always precedes JobFinished
        self.shared.events.emit(BatchEvent::JobCancelling {
            job_id: job_id.to_string(),
        });
        true
    }

    /// Cancels every active job; returns how many accepted the request
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<JobId> = self.shared.active.read().keys().cloned().collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Snapshots of all jobs not yet in history, oldest first
    pub fn active_jobs(&self) -> Vec<ProgressSnapshot> {
        let mut jobs: Vec<Arc<ActiveJob>> = self.shared.active.read().values().cloned().collect();
        jobs.sort_by(|a, b| {
            a.job
                .created_at
                .cmp(&b.job.created_at)
                .then_with(|| a.job.id.cmp(&b.job.id))
        });
        jobs.iter().map(|active| active.snapshot()).collect()
    }

    /// Finished jobs, newest first
    pub fn list_history(&self, limit: Option<usize>) -> Vec<JobHistoryRecord> {
        self.shared.history.list(limit)
    }

    /// One finished job
    pub fn get_history(&self, job_id: &str) -> Option<JobHistoryRecord> {
        self.shared.history.get(job_id)
    }

    /// Aggregate counts over history and active jobs
    pub fn get_stats(&self) -> JobStats {
        let mut stats = JobStats::default();
        // Holding the active map keeps a finishing job from being seen twice
        let active = self.shared.active.read();
        self.shared.history.accumulate_stats(&mut stats);
        for job in active.values() {
            let progress = job.progress.lock();
            stats.total_jobs += 1;
            stats.active_jobs += 1;
            stats.total_succeeded += progress.succeeded();
            stats.total_failed += progress.failed();
        }
        stats
    }

    /// Removes every history record; active jobs are unaffected
    pub fn clear_history(&self) -> usize {
        self.shared.history.clear()
    }

    /// Keeps only the newest `keep` history records
    pub fn trim_history(&self, keep: usize) -> usize {
        self.shared.history.trim(keep)
    }

    /// Waits until the job is terminal and returns its history record
    pub async fn wait_for_completion(&self, job_id: &str) -> CoreResult<JobHistoryRecord> {
        if let Some(active) = self.active_job(job_id) {
            let mut done = active.done_tx.subscribe();
            // The sender lives in `active`, so the channel cannot close here
            if done.wait_for(|finished| *finished).await.is_err() {
                return Err(CoreError::Internal(format!(
                    "completion channel closed for job {job_id}"
                )));
            }
        }

        self.shared
            .history
            .get(job_id)
            .ok_or_else(|| CoreError::NotFound(format!("job {job_id}")))
    }
}
