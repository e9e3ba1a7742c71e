//! Batch Job Module
//!
//! Runs one registered operation over a set of items as a single batch job:
//! admission, bounded per-item dispatch, progress, cancellation and history.

mod budget;
mod dispatch;
mod events;
mod history;
mod operation;
mod progress;
mod scheduler;

pub use budget::*;
pub use events::*;
pub use history::*;
pub use operation::*;
pub use scheduler::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{new_job_id, CoreError, ItemId, JobId, Timestamp};

// =============================================================================
// Operation Kinds
// =============================================================================

/// Operation type tag
///
/// The well-known kinds cover the media operations shipped with the editor;
/// `Custom` keeps the set open for externally registered operations.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OperationKind {
    /// Speech-to-text with Whisper
    WhisperTranscription,
    /// Subtitle file generation
    SubtitleGeneration,
    /// Shot/scene boundary detection
    SceneDetection,
    /// Technical quality checks
    QualityAnalysis,
    /// Spoken language detection
    LanguageDetection,
    /// Color palette and grading analysis
    ColorAnalysis,
    /// Re-encoding for a target platform
    PlatformEncoding,
    /// All analyses in one pass
    ComprehensiveAnalysis,
    /// Any other registered operation
    Custom(String),
}

impl OperationKind {
    /// Wire name of the operation
    pub fn as_str(&self) -> &str {
        match self {
            OperationKind::WhisperTranscription => "whisper_transcription",
            OperationKind::SubtitleGeneration => "subtitle_generation",
            OperationKind::SceneDetection => "scene_detection",
            OperationKind::QualityAnalysis => "quality_analysis",
            OperationKind::LanguageDetection => "language_detection",
            OperationKind::ColorAnalysis => "color_analysis",
            OperationKind::PlatformEncoding => "platform_encoding",
            OperationKind::ComprehensiveAnalysis => "comprehensive_analysis",
            OperationKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let kind = match name {
            "" => {
                return Err(CoreError::ValidationError(
                    "operation name is empty".to_string(),
                ))
            }
            "whisper_transcription" => OperationKind::WhisperTranscription,
            "subtitle_generation" => OperationKind::SubtitleGeneration,
            "scene_detection" => OperationKind::SceneDetection,
            "quality_analysis" => OperationKind::QualityAnalysis,
            "language_detection" => OperationKind::LanguageDetection,
            "color_analysis" => OperationKind::ColorAnalysis,
            "platform_encoding" => OperationKind::PlatformEncoding,
            "comprehensive_analysis" => OperationKind::ComprehensiveAnalysis,
            other => OperationKind::Custom(other.to_string()),
        };
        Ok(kind)
    }
}

impl TryFrom<String> for OperationKind {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OperationKind> for String {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Custom(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

// =============================================================================
// Priority & Status
// =============================================================================

/// Job priority levels
///
/// Advisory only: orders jobs competing for the global budget, never preempts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work
    Low = 0,
    /// Normal priority
    #[default]
    Medium = 1,
    /// User is waiting on the result
    High = 2,
}

impl FromStr for Priority {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" | "normal" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(CoreError::ValidationError(format!(
                "unknown priority: {other}"
            ))),
        }
    }
}

/// Job status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, driver not started yet
    #[default]
    Pending,
    /// Items are being dispatched
    Running,
    /// Cancel requested, waiting for in-flight items to drain
    Cancelling,
    /// Cancelled (terminal)
    Cancelled,
    /// Every item was processed (terminal)
    Completed,
    /// A job-level precondition failed before any item began (terminal)
    FailedToStart,
}

impl JobStatus {
    /// Checks if the status is terminal
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Cancelled | JobStatus::Completed | JobStatus::FailedToStart
        )
    }

    /// Checks if a cancel request is still honored in this status
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// Forward-only transition table
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelling)
                | (Pending, FailedToStart)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Cancelling, Cancelled)
        )
    }

    /// Wire name of the status
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Completed => "completed",
            JobStatus::FailedToStart => "failed_to_start",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Submission
// =============================================================================

/// Caller input to `BatchScheduler::submit`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    /// Operation to run on every item
    pub operation: OperationKind,
    /// Items in dispatch order; duplicates are processed independently
    pub item_ids: Vec<ItemId>,
    /// Opaque options passed to the work function unchanged
    #[serde(default)]
    pub options: serde_json::Value,
    /// Advisory priority (defaults to medium)
    #[serde(default)]
    pub priority: Option<Priority>,
    /// In-flight limit for this job (defaults to the scheduler setting)
    #[serde(default)]
    pub max_concurrent: Option<usize>,
}

impl BatchRequest {
    /// Creates a request with empty options and default limits
    pub fn new<I, S>(operation: OperationKind, item_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ItemId>,
    {
        Self {
            operation,
            item_ids: item_ids.into_iter().map(Into::into).collect(),
            options: serde_json::Value::Object(Default::default()),
            priority: None,
            max_concurrent: None,
        }
    }

    /// Sets the options passed to the work function
    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    /// Sets the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the in-flight limit
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }
}

/// Immutable definition of an admitted job
///
/// Mutable execution state (status, timestamps, results) lives in
/// [`JobProgress`]; this part never changes after submission.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    /// Unique job ID
    pub id: JobId,
    /// Operation run on every item
    pub operation: OperationKind,
    /// Items in dispatch order
    pub item_ids: Vec<ItemId>,
    /// Options passed through to the work function
    pub options: serde_json::Value,
    /// Advisory priority
    pub priority: Priority,
    /// In-flight limit
    pub max_concurrent: usize,
    /// Submission timestamp
    pub created_at: Timestamp,
}

impl BatchJob {
    /// Creates a job from a validated request
    pub(crate) fn from_request(request: BatchRequest, default_max_concurrent: usize) -> Self {
        Self {
            id: new_job_id(),
            operation: request.operation,
            item_ids: request.item_ids,
            options: request.options,
            priority: request.priority.unwrap_or_default(),
            max_concurrent: request.max_concurrent.unwrap_or(default_max_concurrent),
            created_at: chrono::Utc::now(),
        }
    }

    /// Number of items in the job
    pub fn total(&self) -> usize {
        self.item_ids.len()
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of one item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    /// Item ID
    pub item_id: ItemId,
    /// Position of the item in the submitted list
    pub index: usize,
    /// Whether the work function succeeded
    pub success: bool,
    /// Operation-specific result, opaque to the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Error message (present iff `success` is false)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispatch timestamp
    pub started_at: Timestamp,
    /// Completion timestamp
    pub finished_at: Timestamp,
    /// Wall time spent in the work function
    pub duration_ms: u64,
}

/// Point-in-time view of a job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    /// Job ID
    pub job_id: JobId,
    /// Operation
    pub operation: OperationKind,
    /// Number of items submitted
    pub total: usize,
    /// Items whose work function finished
    pub processed: usize,
    /// Items that succeeded
    pub succeeded: usize,
    /// Items that failed
    pub failed: usize,
    /// Items never dispatched because the job was cancelled
    pub skipped: usize,
    /// Items currently running, in dispatch order
    pub in_flight_item_ids: Vec<ItemId>,
    /// Job status
    pub status: JobStatus,
    /// `processed / total` in 0.0..=1.0
    pub percentage: f64,
    /// Rough time left, once at least one item finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
}

/// Immutable summary of a terminated job
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobHistoryRecord {
    /// Job ID
    pub job_id: JobId,
    /// Operation
    pub operation: OperationKind,
    /// Priority the job ran with
    pub priority: Priority,
    /// Terminal status
    pub status: JobStatus,
    /// Number of items submitted
    pub total_items: usize,
    /// Items whose work function finished
    pub total_processed: usize,
    /// Successful items
    pub success_count: usize,
    /// Failed items
    pub failure_count: usize,
    /// Items skipped by cancellation
    pub skipped_count: usize,
    /// `finished_at - started_at`
    pub execution_time_ms: u64,
    /// Submission timestamp
    pub created_at: Timestamp,
    /// Time the job became running
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// Terminal transition timestamp
    pub finished_at: Timestamp,
    /// Per-item outcomes in completion order
    pub results: Vec<ItemResult>,
    /// `"<item>: <message>"` for each failure
    pub errors: Vec<String>,
}

impl JobHistoryRecord {
    /// Terminal snapshot for progress queries on finished jobs
    pub fn to_snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            job_id: self.job_id.clone(),
            operation: self.operation.clone(),
            total: self.total_items,
            processed: self.total_processed,
            succeeded: self.success_count,
            failed: self.failure_count,
            skipped: self.skipped_count,
            in_flight_item_ids: Vec::new(),
            status: self.status,
            percentage: percentage(self.total_processed, self.total_items),
            estimated_remaining_ms: None,
        }
    }
}

/// Aggregate counts across history and active jobs
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    /// Jobs in history plus active jobs
    pub total_jobs: usize,
    /// Completed jobs in history
    pub completed_jobs: usize,
    /// Cancelled jobs in history
    pub cancelled_jobs: usize,
    /// Jobs that failed to start
    pub failed_to_start_jobs: usize,
    /// Successful items (history + active)
    pub total_succeeded: usize,
    /// Failed items (history + active)
    pub total_failed: usize,
    /// Jobs not yet terminal
    pub active_jobs: usize,
}

pub(crate) fn percentage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (processed as f64 / total as f64).clamp(0.0, 1.0)
}
