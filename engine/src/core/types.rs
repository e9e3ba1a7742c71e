//! ReelBatch Core Type Definitions
//!
//! Defines fundamental types used throughout the project.

use chrono::{DateTime, Utc};

// =============================================================================
// ID Types
// =============================================================================

/// Batch job unique identifier (ULID)
pub type JobId = String;

/// Item identifier supplied by the caller (usually a clip ID)
pub type ItemId = String;

// =============================================================================
// Time Types
// =============================================================================

/// UTC timestamp used on jobs, items and history records
pub type Timestamp = DateTime<Utc>;

/// Milliseconds elapsed between two timestamps, never negative.
pub fn elapsed_ms(start: Timestamp, end: Timestamp) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Generates a new job identifier.
pub fn new_job_id() -> JobId {
    ulid::Ulid::new().to_string()
}
