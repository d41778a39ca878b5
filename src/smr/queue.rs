//! Deferred-work FIFO.
//!
//! Grounded on `original_source/fastsmr/fifo.c`: the source's `fifo_t` is a
//! bare head/tail pair, safe only because every caller already holds
//! `rcu_mutex`. The same invariant holds here, so a `Mutex<VecDeque<_>>` is
//! a direct translation rather than a simplification of it.
//!
//! Also owns the two counters `smr_scan`
//! (`original_source/fastsmr/smrscan.c`) keeps at file scope: `current`,
//! the pass's scan sequence number, and the single `psequence` cell every
//! FIFO item enqueued here shares as its cohort anchor (see `defer.rs`).
//! The retrieved source never shows more than one `fifo_t`/`psequence` in
//! use at a time, so one cohort per queue is what's actually grounded —
//! not an invented multi-cohort grouping API.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::defer::DeferredWork;

#[derive(Default)]
pub(crate) struct DeferQueue {
    items: Mutex<VecDeque<Box<DeferredWork>>>,
    scan_sequence: AtomicU64,
    fifo_cohort: AtomicU64,
}

impl DeferQueue {
    pub(crate) fn new() -> DeferQueue {
        DeferQueue::default()
    }

    pub(crate) fn enqueue(&self, work: Box<DeferredWork>) {
        self.items.lock().unwrap().push_back(work);
    }

    pub(crate) fn dequeue_all(&self) -> Vec<Box<DeferredWork>> {
        self.items.lock().unwrap().drain(..).collect()
    }

    pub(crate) fn requeue_all(&self, work: Vec<Box<DeferredWork>>) {
        let mut items = self.items.lock().unwrap();
        for item in work {
            items.push_back(item);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advances and returns this pass's scan sequence number. Mirrors
    /// `smr_scan`'s `current++`.
    pub(crate) fn next_scan_sequence(&self) -> u64 {
        self.scan_sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The shared `psequence` cell every FIFO item enqueued here reads and
    /// writes during a scan pass.
    pub(crate) fn fifo_cohort(&self) -> &AtomicU64 {
        &self.fifo_cohort
    }
}
