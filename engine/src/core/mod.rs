//! ReelBatch Core Engine
//!
//! Handles batch admission, per-item dispatch, progress, cancellation and history.

pub mod batch;
pub mod fs;
pub mod settings;

// Re-export common types
mod types;
pub use types::*;

mod error;
pub use error::*;

#[cfg(test)]
mod tests_scheduler;
