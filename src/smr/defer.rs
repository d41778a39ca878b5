//! The deferred-work record SMR's poller carries through the scan queue.
//!
//! Grounded on `original_source/fastsmr/fastsmr.h`'s `rcu_defer_t`: the
//! source's `(func, arg)` function-pointer-plus-void-star pair becomes a
//! boxed closure here, and its `forrefs` graph-trace machinery becomes a
//! `still_reachable` predicate closure for the trace class — a
//! caller-supplied liveness check in place of a fixed node-shape walk.
//!
//! `sequence`/`psequence` are kept, though, because they carry a function
//! `forrefs` doesn't: `original_source/fastsmr/smrscan.c`'s `smr_scan`
//! (roughly lines 330-430) uses them to hold back FIFO reclamation order.
//! Every FIFO item in a queue shares one `psequence` cell (owned by
//! `DeferQueue`, see `queue.rs`). On a scan, a still-hazarded FIFO item
//! stamps that shared cell with the current scan's sequence number; any
//! FIFO item processed later in the same pass — hazarded or not — that
//! reads the cell back at that same number gets requeued too. An
//! unreachable item behind a still-hazarded one in enqueue order is
//! therefore held back rather than reclaimed out of order, even though
//! nothing protects it directly.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) enum DeferClass {
    /// Reclaim once no hazard pointer anywhere names `ptr`, and no earlier
    /// (by enqueue order) still-hazarded FIFO item is holding the cohort
    /// back.
    Fifo,
    /// Reclaim once `still_reachable` reports `false`, independent of
    /// `ptr`'s presence in the hazard set and of FIFO cohort ordering.
    Trace { still_reachable: Box<dyn Fn() -> bool + Send> },
}

pub(crate) struct DeferredWork {
    pub(crate) ptr: *mut (),
    pub(crate) action: Option<Box<dyn FnOnce() + Send>>,
    pub(crate) class: DeferClass,
    /// This item's scan sequence number — the FIFO cohort's `psequence`
    /// carried by value once this item has been classified for a pass.
    /// Unused by `Trace`.
    sequence: u64,
}

// `ptr` is an opaque identity tag compared by address only, never
// dereferenced by the queue or the poller.
unsafe impl Send for DeferredWork {}

impl DeferredWork {
    pub(crate) fn fifo(ptr: *mut (), action: Box<dyn FnOnce() + Send>) -> Box<DeferredWork> {
        Box::new(DeferredWork { ptr, action: Some(action), class: DeferClass::Fifo, sequence: 0 })
    }

    pub(crate) fn trace(
        ptr: *mut (),
        action: Box<dyn FnOnce() + Send>,
        still_reachable: Box<dyn Fn() -> bool + Send>,
    ) -> Box<DeferredWork> {
        Box::new(DeferredWork {
            ptr,
            action: Some(action),
            class: DeferClass::Trace { still_reachable },
            sequence: 0,
        })
    }

    /// Classifies this item for the pass at `current`, returning `true` if
    /// it must be requeued (still protected) or `false` if it's safe to
    /// reclaim now. `fifo_cohort` is the owning queue's shared `psequence`
    /// cell; only `Fifo` items read or write it.
    pub(crate) fn scan(&mut self, current: u64, hazards: &[*mut ()], fifo_cohort: &AtomicU64) -> bool {
        match &self.class {
            DeferClass::Fifo => {
                if hazards.contains(&self.ptr) {
                    self.sequence = current;
                    fifo_cohort.store(current, Ordering::Relaxed);
                } else {
                    self.sequence = fifo_cohort.load(Ordering::Relaxed);
                }
                self.sequence == current
            }
            DeferClass::Trace { still_reachable } => still_reachable(),
        }
    }

    pub(crate) fn run(mut self: Box<Self>) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
