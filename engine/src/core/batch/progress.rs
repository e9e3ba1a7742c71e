//! Progress Tracker
//!
//! Mutable execution state of one active job. Every change (dispatch, item
//! outcome, status transition) is a single call on `&mut JobProgress` made
//! under the job's lock, so snapshots are never torn.

use std::collections::BTreeMap;

use super::{percentage, BatchJob, ItemResult, JobHistoryRecord, JobStatus, ProgressSnapshot};
use crate::core::{elapsed_ms, ItemId, Timestamp};

/// Live state of an active job
#[derive(Debug)]
pub(crate) struct JobProgress {
    status: JobStatus,
    started_at: Option<Timestamp>,
    finished_at: Option<Timestamp>,
    /// Keyed by item index so duplicate IDs stay distinct
    in_flight: BTreeMap<usize, (ItemId, Timestamp)>,
    results: Vec<ItemResult>,
    dispatched: usize,
    succeeded: usize,
    failed: usize,
    item_time_ms: u64,
    precondition_error: Option<String>,
}

impl JobProgress {
    pub(crate) fn new() -> Self {
        Self {
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            in_flight: BTreeMap::new(),
            results: Vec::new(),
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            item_time_ms: 0,
            precondition_error: None,
        }
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.status
    }

    pub(crate) fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub(crate) fn failed(&self) -> usize {
        self.failed
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Applies a forward transition; returns false (and changes nothing) otherwise
    pub(crate) fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = chrono::Utc::now();
        if next == JobStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        true
    }

    /// Marks `pending -> failed_to_start` with the precondition message
    pub(crate) fn fail_to_start(&mut self, error: String) -> bool {
        if self.transition(JobStatus::FailedToStart) {
            self.precondition_error = Some(error);
            true
        } else {
            false
        }
    }

    /// Records that item `index` was handed to its work function
    pub(crate) fn mark_dispatched(&mut self, index: usize, item_id: &str) {
        self.in_flight
            .insert(index, (item_id.to_string(), chrono::Utc::now()));
        self.dispatched += 1;
    }

    /// Records the outcome of item `index` and removes it from the in-flight set
    pub(crate) fn record(
        &mut self,
        index: usize,
        outcome: Result<serde_json::Value, String>,
    ) -> Option<&ItemResult> {
        let (item_id, started_at) = self.in_flight.remove(&index)?;
        let finished_at = chrono::Utc::now();
        let duration_ms = elapsed_ms(started_at, finished_at);
        self.item_time_ms += duration_ms;

        let (success, payload, error) = match outcome {
            Ok(payload) => {
                self.succeeded += 1;
                (true, Some(payload), None)
            }
            Err(error) => {
                self.failed += 1;
                (false, None, Some(error))
            }
        };

        self.results.push(ItemResult {
            item_id,
            index,
            success,
            payload,
            error,
            started_at,
            finished_at,
            duration_ms,
        });
        self.results.last()
    }

    /// Records every remaining in-flight item as failed; returns how many
    pub(crate) fn fail_in_flight(&mut self, error: &str) -> usize {
        let orphans: Vec<usize> = self.in_flight.keys().copied().collect();
        for index in &orphans {
            self.record(*index, Err(error.to_string()));
        }
        orphans.len()
    }

    fn processed(&self) -> usize {
        self.succeeded + self.failed
    }

    fn skipped(&self, total: usize) -> usize {
        match self.status {
            JobStatus::Cancelling | JobStatus::Cancelled | JobStatus::FailedToStart => {
                total.saturating_sub(self.dispatched)
            }
            _ => 0,
        }
    }

    fn estimated_remaining_ms(&self, job: &BatchJob) -> Option<u64> {
        let processed = self.processed();
        if self.status != JobStatus::Running || processed == 0 {
            return None;
        }
        let remaining = job.total().saturating_sub(processed);
        let lanes = job.max_concurrent.min(remaining).max(1) as u64;
        let avg = self.item_time_ms / processed as u64;
        Some(avg * remaining as u64 / lanes)
    }

    /// Consistent point-in-time view
    pub(crate) fn snapshot(&self, job: &BatchJob) -> ProgressSnapshot {
        let total = job.total();
        let processed = self.processed();
        ProgressSnapshot {
            job_id: job.id.clone(),
            operation: job.operation.clone(),
            total,
            processed,
            succeeded: self.succeeded,
            failed: self.failed,
            skipped: self.skipped(total),
            in_flight_item_ids: self.in_flight.values().map(|(id, _)| id.clone()).collect(),
            status: self.status,
            percentage: percentage(processed, total),
            estimated_remaining_ms: self.estimated_remaining_ms(job),
        }
    }

    /// Builds the history record; only valid once the job is terminal
    pub(crate) fn to_record(&self, job: &BatchJob) -> JobHistoryRecord {
        let total = job.total();
        let finished_at = self.finished_at.unwrap_or_else(chrono::Utc::now);
        let execution_time_ms = self
            .started_at
            .map(|start| elapsed_ms(start, finished_at))
            .unwrap_or(0);

        let mut errors: Vec<String> = self
            .results
            .iter()
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {}", r.item_id, e)))
            .collect();
        if let Some(error) = &self.precondition_error {
            errors.insert(0, error.clone());
        }

        JobHistoryRecord {
            job_id: job.id.clone(),
            operation: job.operation.clone(),
            priority: job.priority,
            status: self.status,
            total_items: total,
            total_processed: self.processed(),
            success_count: self.succeeded,
            failure_count: self.failed,
            skipped_count: self.skipped(total),
            execution_time_ms,
            created_at: job.created_at,
            started_at: self.started_at,
            finished_at,
            results: self.results.clone(),
            errors,
        }
    }
}
