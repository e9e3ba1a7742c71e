//! ReelBatch Core Library
//!
//! Batch operation scheduler for media items.
//! A caller submits a set of clips for one registered operation
//! (transcription, scene detection, quality analysis, ...) and the scheduler
//! runs the per-item work with bounded concurrency, live progress,
//! cancellation and a history of finished jobs.
//!
//! ## Usage
//!
//! Build an [`core::batch::OperationRegistry`] once at startup, hand it to a
//! [`core::batch::BatchScheduler`] and pass the scheduler around explicitly.
//! The scheduler must be used from within a tokio runtime.

pub mod core;
