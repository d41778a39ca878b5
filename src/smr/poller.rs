//! The scan pass over registered hazard-pointer nodes and the deferred
//! work queue.
//!
//! Grounded on `original_source/fastsmr/smrscan.c`'s `smr_scan`. The
//! source also runs a separate two-generation RCU pass (`rcuscan.c`)
//! ahead of the hazard-pointer scan, shrinking the window a reader has to
//! win a race against reclamation by requiring two quiescent points
//! instead of one; that pass depends on OS/scheduler quiescent-state
//! counters (`qcount_t`) with no portable userspace equivalent, so this
//! implementation folds everything into the single hazard-pointer scan
//! below (see `DESIGN.md`) — correctness is unaffected, only the size of
//! the deferred-work queue under sustained load.

use std::sync::Arc;

use log::trace;

use super::defer::DeferredWork;
use super::hazard::SmrNode;
use super::queue::DeferQueue;

pub(crate) struct ScanStats {
    pub(crate) reclaimed: usize,
    pub(crate) requeued: usize,
}

/// One pass: snapshot every registered thread's hazard pairs, then walk
/// the deferred queue in enqueue order, partitioning into "still
/// protected" (requeued) and "safe" (reclaimed immediately). Walking in
/// enqueue order matters: it's what lets a still-hazarded FIFO item stamp
/// the queue's shared cohort cell before later (younger) FIFO items in
/// the same pass read it back, holding them off reclamation in turn.
pub(crate) fn scan_once(nodes: &[Arc<SmrNode>], queue: &DeferQueue) -> ScanStats {
    let mut hazards = Vec::with_capacity(nodes.len() * 2);
    for node in nodes {
        for ptr in node.snapshot() {
            if !ptr.is_null() {
                hazards.push(ptr);
            }
        }
    }

    let current = queue.next_scan_sequence();
    let pending = queue.dequeue_all();
    let mut requeue = Vec::new();
    let mut reclaimed = 0usize;
    for mut work in pending {
        if work.scan(current, &hazards, queue.fifo_cohort()) {
            requeue.push(work);
        } else {
            work.run();
            reclaimed += 1;
        }
    }
    let requeued = requeue.len();
    queue.requeue_all(requeue);
    trace!("smr: scan pass reclaimed={} requeued={}", reclaimed, requeued);
    ScanStats { reclaimed, requeued }
}

/// Runs every queued item to completion regardless of hazard state. Used
/// for the last-thread-deregisters short-circuit and for shutdown drain,
/// where there is provably no reader left to protect anything.
pub(crate) fn drain_unconditionally(queue: &DeferQueue) -> usize {
    let pending: Vec<Box<DeferredWork>> = queue.dequeue_all();
    let n = pending.len();
    for work in pending {
        work.run();
    }
    n
}
