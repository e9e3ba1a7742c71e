//! Job History Store
//!
//! Append-only, time-ordered collection of finished jobs. Records are shared
//! as `Arc<JobHistoryRecord>` internally and handed out as clones, so nothing
//! a caller does can alter a stored record.
//!
//! With a journal configured, each appended record is also written as one
//! JSON line, and the file is loaded again on startup.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::{JobHistoryRecord, JobStats, JobStatus, ProgressSnapshot};
use crate::core::{fs::atomic_write_json_lines, CoreResult};

// =============================================================================
// Journal
// =============================================================================

/// Result of reading the journal
#[derive(Debug, Default)]
pub struct JournalLoad {
    /// Successfully parsed records, oldest first
    pub records: Vec<JobHistoryRecord>,
    /// Lines that failed to parse (line number, error message)
    pub errors: Vec<(usize, String)>,
}

/// JSONL file backing the history store
#[derive(Clone, Debug)]
pub struct HistoryJournal {
    path: PathBuf,
}

impl HistoryJournal {
    /// Creates a journal for the given path (the file is created lazily)
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path to the journal file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record
    pub fn append(&self, record: &JobHistoryRecord) -> CoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let mut writer = BufWriter::new(file);
        let json = serde_json::to_string(record)?;
        writeln!(writer, "{}", json)?;
        writer.flush()?;

        Ok(())
    }

    /// Reads all records, skipping corrupted lines
    pub fn load(&self) -> CoreResult<JournalLoad> {
        if !self.path.exists() {
            return Ok(JournalLoad::default());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut load = JournalLoad::default();

        for (line_num, line_result) in reader.lines().enumerate() {
            let line_number = line_num + 1;
            match line_result {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<JobHistoryRecord>(trimmed) {
                        Ok(record) => load.records.push(record),
                        Err(e) => load
                            .errors
                            .push((line_number, format!("JSON parse error: {}", e))),
                    }
                }
                Err(e) => load.errors.push((line_number, format!("IO error: {}", e))),
            }
        }

        Ok(load)
    }

    /// Replaces the file content with exactly `records`
    pub fn rewrite<'a, I>(&self, records: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = &'a JobHistoryRecord>,
    {
        atomic_write_json_lines(&self.path, records)
    }
}

// =============================================================================
// Store
// =============================================================================

/// Journal work left over from an in-memory change
///
/// Produced under the history lock, applied later by [`HistoryStore::persist`]
/// so file I/O never runs while a lock is held.
#[must_use]
#[derive(Debug)]
pub enum JournalWrite {
    /// Nothing to write (no journal configured)
    Nothing,
    /// One record appended at position `seq`
    Append {
        seq: u64,
        record: Arc<JobHistoryRecord>,
    },
    /// Records were dropped; the file must be rewritten
    Rewrite,
}

impl JournalWrite {
    /// Whether `persist` has anything to do
    pub fn is_pending(&self) -> bool {
        !matches!(self, JournalWrite::Nothing)
    }
}

#[derive(Debug, Default)]
struct Records {
    entries: VecDeque<Arc<JobHistoryRecord>>,
    /// Records pushed since startup
    pushed: u64,
}

/// In-memory history with optional retention bound and journal
#[derive(Debug)]
pub struct HistoryStore {
    records: RwLock<Records>,
    /// 0 = unbounded
    limit: usize,
    journal: Option<HistoryJournal>,
    /// Serializes journal writers
    persisted: Mutex<JournalCursor>,
}

/// How far the journal file reflects the in-memory records
#[derive(Debug, Default)]
struct JournalCursor {
    /// Highest push written to the file
    seq: u64,
    /// A failed write left the file out of step
    stale: bool,
}

impl HistoryStore {
    /// Creates an empty store without a journal
    pub fn in_memory(limit: usize) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            limit,
            journal: None,
            persisted: Mutex::new(JournalCursor::default()),
        }
    }

    /// Creates a store backed by `journal`, loading any existing records
    ///
    /// Corrupted lines are skipped and the file is compacted; a journal that
    /// cannot be read at all starts the store empty.
    pub fn with_journal(limit: usize, journal: HistoryJournal) -> Self {
        let load = match journal.load() {
            Ok(load) => load,
            Err(e) => {
                warn!(path = ?journal.path(), "Failed to read history journal: {}", e);
                JournalLoad::default()
            }
        };

        let loaded = load.records.len();
        let mut entries: VecDeque<Arc<JobHistoryRecord>> =
            load.records.into_iter().map(Arc::new).collect();
        let mut dirty = !load.errors.is_empty();
        for (line, error) in &load.errors {
            warn!(path = ?journal.path(), line, "Skipping corrupted history line: {}", error);
        }

        if limit > 0 && entries.len() > limit {
            let excess = entries.len() - limit;
            entries.drain(..excess);
            dirty = true;
        }

        info!(path = ?journal.path(), loaded, kept = entries.len(), "History journal loaded");

        let store = Self {
            records: RwLock::new(Records { entries, pushed: 0 }),
            limit,
            journal: Some(journal),
            persisted: Mutex::new(JournalCursor::default()),
        };
        if dirty {
            store.persist(JournalWrite::Rewrite);
        }
        store
    }

    fn pending_rewrite(&self) -> JournalWrite {
        if self.journal.is_some() {
            JournalWrite::Rewrite
        } else {
            JournalWrite::Nothing
        }
    }

    /// Adds a record in memory; drops the oldest ones beyond the retention bound
    ///
    /// The returned journal work must be handed to [`persist`](Self::persist).
    pub fn push(&self, record: JobHistoryRecord) -> JournalWrite {
        let mut records = self.records.write();
        debug!(job_id = %record.job_id, status = %record.status, "Appending history record");

        let record = Arc::new(record);
        records.entries.push_back(Arc::clone(&record));
        records.pushed += 1;

        if self.limit > 0 && records.entries.len() > self.limit {
            let excess = records.entries.len() - self.limit;
            records.entries.drain(..excess);
            return self.pending_rewrite();
        }
        match self.journal {
            Some(_) => JournalWrite::Append {
                seq: records.pushed,
                record,
            },
            None => JournalWrite::Nothing,
        }
    }

    /// Brings the journal file up to date with `write`
    ///
    /// Writers may arrive out of order. An append that is not the next one
    /// in sequence falls back to a rewrite from the current records, and one
    /// already covered by an earlier rewrite is skipped.
    pub fn persist(&self, write: JournalWrite) {
        let Some(journal) = &self.journal else {
            return;
        };
        let mut cursor = self.persisted.lock();

        match write {
            JournalWrite::Nothing => {}
            JournalWrite::Append { seq, .. } if seq <= cursor.seq => {}
            JournalWrite::Append { seq, record } if seq == cursor.seq + 1 && !cursor.stale => {
                match journal.append(&record) {
                    Ok(()) => cursor.seq = seq,
                    Err(e) => {
                        cursor.stale = true;
                        warn!(job_id = %record.job_id, "Failed to append history journal: {}", e)
                    }
                }
            }
            JournalWrite::Append { .. } | JournalWrite::Rewrite => {
                let (entries, pushed) = {
                    let records = self.records.read();
                    (records.entries.iter().cloned().collect::<Vec<_>>(), records.pushed)
                };
                match journal.rewrite(entries.iter().map(|r| r.as_ref())) {
                    Ok(()) => {
                        cursor.seq = pushed;
                        cursor.stale = false;
                    }
                    Err(e) => {
                        cursor.stale = true;
                        warn!(path = ?journal.path(), "Failed to rewrite history journal: {}", e)
                    }
                }
            }
        }
    }

    /// Adds a record and writes it to the journal
    pub fn append(&self, record: JobHistoryRecord) {
        let write = self.push(record);
        self.persist(write);
    }

    /// Looks up one record
    pub fn get(&self, job_id: &str) -> Option<JobHistoryRecord> {
        self.records
            .read()
            .entries
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .map(|r| r.as_ref().clone())
    }

    /// Final progress of a finished job, without copying its results
    pub fn snapshot(&self, job_id: &str) -> Option<ProgressSnapshot> {
        self.records
            .read()
            .entries
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .map(|r| r.to_snapshot())
    }

    /// Newest-first listing, truncated to `limit`
    pub fn list(&self, limit: Option<usize>) -> Vec<JobHistoryRecord> {
        let records = self.records.read();
        records
            .entries
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .map(|r| r.as_ref().clone())
            .collect()
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().entries.len()
    }

    /// Checks if the store is empty
    pub fn is_empty(&self) -> bool {
        self.records.read().entries.is_empty()
    }

    /// Removes every record; returns how many were removed
    pub fn clear(&self) -> usize {
        let removed = {
            let mut records = self.records.write();
            let removed = records.entries.len();
            records.entries.clear();
            removed
        };
        self.persist(self.pending_rewrite());
        info!(removed, "History cleared");
        removed
    }

    /// Keeps the newest `keep` records; returns how many were removed
    pub fn trim(&self, keep: usize) -> usize {
        let removed = {
            let mut records = self.records.write();
            if records.entries.len() <= keep {
                return 0;
            }
            let removed = records.entries.len() - keep;
            records.entries.drain(..removed);
            removed
        };
        self.persist(self.pending_rewrite());
        info!(removed, kept = keep, "History trimmed");
        removed
    }

    /// Adds history totals to `stats`
    pub(crate) fn accumulate_stats(&self, stats: &mut JobStats) {
        for record in self.records.read().entries.iter() {
            stats.total_jobs += 1;
            stats.total_succeeded += record.success_count;
            stats.total_failed += record.failure_count;
            match record.status {
                JobStatus::Completed => stats.completed_jobs += 1,
                JobStatus::Cancelled => stats.cancelled_jobs += 1,
                JobStatus::FailedToStart => stats.failed_to_start_jobs += 1,
                _ => {}
            }
        }
    }
}
