//! Global Concurrency Budget
//!
//! Optional process-wide ceiling on in-flight items across all jobs.
//! When permits run out, waiting dispatches are admitted highest priority
//! first and FIFO within a priority. Running items are never preempted.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use super::Priority;
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Waiters
// =============================================================================

struct Waiter {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<BudgetPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier arrival
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct BudgetState {
    available: usize,
    next_seq: u64,
    waiters: BinaryHeap<Waiter>,
}

struct BudgetInner {
    capacity: usize,
    state: Mutex<BudgetState>,
}

impl BudgetInner {
    /// Hands a released permit to the best live waiter, or returns it to the pool.
    fn release(self: &Arc<Self>) {
        loop {
            let waiter = {
                let mut state = self.state.lock();
                match state.waiters.pop() {
                    Some(waiter) => waiter,
                    None => {
                        state.available += 1;
                        return;
                    }
                }
            };

            // Sent outside the lock: a permit dropped on a failed hand-off
            // would otherwise re-enter `release` while the lock is held.
            let permit = BudgetPermit {
                inner: Some(Arc::clone(self)),
            };
            match waiter.tx.send(permit) {
                Ok(()) => return,
                Err(mut unclaimed) => {
                    // Waiter gave up (job cancelled); try the next one.
                    unclaimed.inner = None;
                }
            }
        }
    }
}

// =============================================================================
// Budget
// =============================================================================

/// Priority-aware permit pool shared by all jobs of a scheduler
#[derive(Clone)]
pub struct GlobalBudget {
    inner: Arc<BudgetInner>,
}

impl fmt::Debug for GlobalBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GlobalBudget")
            .field("capacity", &self.inner.capacity)
            .field("available", &state.available)
            .field("waiting", &state.waiters.len())
            .finish()
    }
}

impl GlobalBudget {
    /// Creates a budget with `capacity` permits (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BudgetInner {
                capacity,
                state: Mutex::new(BudgetState {
                    available: capacity,
                    next_seq: 0,
                    waiters: BinaryHeap::new(),
                }),
            }),
        }
    }

    /// Total number of permits
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.inner.state.lock().available
    }

    /// Dispatches currently waiting for a permit
    pub fn waiting(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Takes a permit without waiting, if one is free and nobody is queued
    pub fn try_acquire(&self) -> Option<BudgetPermit> {
        let mut state = self.inner.state.lock();
        if state.available > 0 && state.waiters.is_empty() {
            state.available -= 1;
            return Some(BudgetPermit {
                inner: Some(Arc::clone(&self.inner)),
            });
        }
        None
    }

    /// Waits for a permit
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue; a permit handed over concurrently is returned to the pool.
    pub async fn acquire(&self, priority: Priority) -> CoreResult<BudgetPermit> {
        let rx = {
            let mut state = self.inner.state.lock();
            if state.available > 0 && state.waiters.is_empty() {
                state.available -= 1;
                return Ok(BudgetPermit {
                    inner: Some(Arc::clone(&self.inner)),
                });
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.waiters.push(Waiter { priority, seq, tx });
            rx
        };

        rx.await
            .map_err(|_| CoreError::Internal("global budget closed".to_string()))
    }
}

/// One unit of the global budget; returned to the pool on drop
pub struct BudgetPermit {
    inner: Option<Arc<BudgetInner>>,
}

impl fmt::Debug for BudgetPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BudgetPermit").finish()
    }
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}
