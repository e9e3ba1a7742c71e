//! Batch Event Stream
//!
//! Broadcasts job and item lifecycle changes to live progress consumers
//! (CLI progress lines, UI panels). Delivery is best effort: a lagging
//! subscriber loses the oldest events, and sending with no subscribers is fine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{JobStatus, OperationKind, ProgressSnapshot};
use crate::core::{ItemId, JobId};

/// Event names used by front-ends
pub mod event_names {
    /// Job registered
    pub const JOB_QUEUED: &str = "batch:queued";
    /// Job started dispatching
    pub const JOB_STARTED: &str = "batch:started";
    /// Item handed to its work function
    pub const ITEM_STARTED: &str = "batch:item-started";
    /// Item finished (success or failure)
    pub const ITEM_FINISHED: &str = "batch:item-finished";
    /// Cancel requested
    pub const JOB_CANCELLING: &str = "batch:cancelling";
    /// Job reached a terminal status
    pub const JOB_FINISHED: &str = "batch:finished";
}

/// Lifecycle event
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BatchEvent {
    /// Job registered in pending state
    JobQueued {
        job_id: JobId,
        operation: OperationKind,
        total: usize,
    },
    /// Job moved to running
    JobStarted { job_id: JobId },
    /// Item dispatched
    ItemStarted {
        job_id: JobId,
        item_id: ItemId,
        index: usize,
    },
    /// Item outcome recorded
    ItemFinished {
        job_id: JobId,
        item_id: ItemId,
        index: usize,
        success: bool,
        progress: ProgressSnapshot,
    },
    /// Job moved to cancelling
    JobCancelling { job_id: JobId },
    /// Job reached a terminal status and moved to history
    JobFinished {
        job_id: JobId,
        status: JobStatus,
        success_count: usize,
        failure_count: usize,
        skipped_count: usize,
    },
}

impl BatchEvent {
    /// Event name for front-end routing
    pub fn name(&self) -> &'static str {
        match self {
            BatchEvent::JobQueued { .. } => event_names::JOB_QUEUED,
            BatchEvent::JobStarted { .. } => event_names::JOB_STARTED,
            BatchEvent::ItemStarted { .. } => event_names::ITEM_STARTED,
            BatchEvent::ItemFinished { .. } => event_names::ITEM_FINISHED,
            BatchEvent::JobCancelling { .. } => event_names::JOB_CANCELLING,
            BatchEvent::JobFinished { .. } => event_names::JOB_FINISHED,
        }
    }

    /// Job the event belongs to
    pub fn job_id(&self) -> &str {
        match self {
            BatchEvent::JobQueued { job_id, .. }
            | BatchEvent::JobStarted { job_id }
            | BatchEvent::ItemStarted { job_id, .. }
            | BatchEvent::ItemFinished { job_id, .. }
            | BatchEvent::JobCancelling { job_id }
            | BatchEvent::JobFinished { job_id, .. } => job_id,
        }
    }
}

/// Fan-out sender shared by the scheduler and its job drivers
#[derive(Clone, Debug)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: BatchEvent) {
        // Err only means nobody is listening
        let _ = self.tx.send(event);
    }
}
