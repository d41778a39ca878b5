//! The per-object control block and the thread-local handle readers hold
//! into it.
//!
//! The two counters are packed into a single `AtomicI64` rather than kept
//! as the source's separate `long ecount; long rcount;` pair: the low 32
//! bits hold `ephemeral`, the high 32 bits hold `reference`, and both are
//! maintained with `fetch_add`/`fetch_sub` on the combined word. That makes
//! "did the sum just reach zero" a single atomic read of the word the
//! decrement already returned, instead of two separate loads that would
//! otherwise race each other at exactly the moment both counters approach
//! zero.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicI64, Ordering};

const EPHEMERAL_UNIT: i64 = 1;
const REFERENCE_UNIT: i64 = 1i64 << 32;

/// Callback invoked instead of dropping+deallocating a control block,
/// letting a data structure pool and reuse them. Mirrors the AP recycle-pool
/// setter in the external interface.
pub type RecycleFn<T> = Box<dyn Fn(Box<ControlBlock<T>>) + Send + Sync>;

pub struct ControlBlock<T> {
    data: ManuallyDrop<T>,
    count: AtomicI64,
    recycle: Option<RecycleFn<T>>,
}

impl<T> ControlBlock<T> {
    /// A freshly allocated control block starts with `ephemeral = 1`: the
    /// same "one unit, paid back on drop" claim a `load()` produces. A
    /// handle constructed directly (not via `load`) is indistinguishable
    /// from one produced by a load once it exists — both convert into a
    /// slot's persistent reference the same way when stored.
    pub fn new_boxed(value: T, recycle: Option<RecycleFn<T>>) -> Box<ControlBlock<T>> {
        Box::new(ControlBlock {
            data: ManuallyDrop::new(value),
            count: AtomicI64::new(EPHEMERAL_UNIT),
            recycle,
        })
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    /// Adds `n` ephemeral units. Used by `AtomicSlot::swap`/`store` when
    /// reconciling a displaced slot's accumulated delta.
    pub(crate) fn add_ephemeral(&self, n: i64) {
        self.count.fetch_add(n * EPHEMERAL_UNIT, Ordering::Relaxed);
    }

    /// Adds `n` reference units. Used whenever a `LocalHandle` is converted
    /// into a slot's persistent reference (store/swap/cas of the new
    /// value).
    pub(crate) fn add_reference(&self, n: i64) {
        self.count.fetch_add(n * REFERENCE_UNIT, Ordering::Relaxed);
    }

    /// Drops `n` ephemeral units. Returns `true` exactly once, for
    /// whichever caller's decrement makes the combined word reach zero —
    /// that caller is responsible for destroying the block.
    pub(crate) fn drop_ephemeral(&self, n: i64) -> bool {
        Self::finish_drop(self.count.fetch_sub(n * EPHEMERAL_UNIT, Ordering::Release) - n * EPHEMERAL_UNIT)
    }

    /// Drops `n` reference units, combined with an ephemeral adjustment in
    /// one RMW — the reconciliation step a slot swap performs on the
    /// displaced control block.
    pub(crate) fn reconcile_displaced(&self, ephemeral_delta: i64, reference_drop: i64) -> bool {
        let delta = ephemeral_delta * EPHEMERAL_UNIT - reference_drop * REFERENCE_UNIT;
        let old = self.count.fetch_add(delta, Ordering::AcqRel);
        Self::finish_drop(old + delta)
    }

    fn finish_drop(new_count: i64) -> bool {
        if new_count == 0 {
            // The decrement that brought the count to zero happens-before
            // this fence; anything the destructor reads about the object
            // must not be reordered ahead of the release stores that got
            // us here.
            fence(Ordering::Acquire);
            true
        } else {
            debug_assert!(new_count >= 0, "refcount underflow on AP control block");
            false
        }
    }

    /// Destroys (or recycles) a control block once its count has reached
    /// zero. Safety: caller must have observed `true` from one of the
    /// `drop_*`/`reconcile_*` methods above for this exact block, exactly
    /// once.
    pub(crate) unsafe fn destroy(mut boxed: Box<ControlBlock<T>>) {
        if let Some(recycle) = boxed.recycle.take() {
            recycle(boxed);
        } else {
            ManuallyDrop::drop(&mut boxed.data);
        }
    }
}

/// A thread-local, safe-to-dereference-for-its-full-lifetime reference into
/// the object currently (or formerly) held by an `AtomicSlot`.
///
/// Internally this is exactly one "unit" of either an ephemeral or a
/// reference claim on the pointed-to control block — which one is an
/// implementation detail the type doesn't expose; `Drop` always pays the
/// claim back as an ephemeral unit, which is correct regardless of whether
/// the physical bookkeeping for this unit currently lives in the block's
/// own counter or is still sitting, unreconciled, in some slot's delta (see
/// `slot.rs` for why that's safe).
pub struct LocalHandle<T> {
    pub(crate) ptr: NonNull<ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for LocalHandle<T> {}
unsafe impl<T: Send + Sync> Sync for LocalHandle<T> {}

impl<T> LocalHandle<T> {
    pub fn new(value: T) -> LocalHandle<T> {
        let boxed = ControlBlock::new_boxed(value, None);
        LocalHandle { ptr: NonNull::from(Box::leak(boxed)) }
    }

    pub fn new_with_recycle(value: T, recycle: RecycleFn<T>) -> LocalHandle<T> {
        let boxed = ControlBlock::new_boxed(value, Some(recycle));
        LocalHandle { ptr: NonNull::from(Box::leak(boxed)) }
    }

    pub(crate) fn control(&self) -> &ControlBlock<T> {
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn as_ptr(&self) -> *mut ControlBlock<T> {
        self.ptr.as_ptr()
    }

    /// Wraps a raw control-block pointer that already owns one ephemeral
    /// unit, without touching any counter. Used internally whenever a new
    /// handle is minted as the direct result of an atomic RMW that already
    /// accounted for the claim (e.g. `AtomicSlot::load`).
    pub(crate) unsafe fn from_raw_claimed(ptr: NonNull<ControlBlock<T>>) -> LocalHandle<T> {
        LocalHandle { ptr }
    }

    /// Converts this handle's ephemeral claim into the persistent
    /// `reference` claim a slot holds on whatever it currently contains,
    /// and hands back the bare pointer for the slot word. Used by
    /// `store`/`swap`/`cas` when installing a new value.
    pub(crate) fn into_reference_ptr(self) -> NonNull<ControlBlock<T>> {
        let ptr = self.ptr;
        let control = unsafe { ptr.as_ref() };
        control.add_reference(1);
        let reached_zero = control.drop_ephemeral(1);
        debug_assert!(!reached_zero, "handle's own claim cannot be the last one while being installed");
        std::mem::forget(self);
        ptr
    }
}

impl<T> std::ops::Deref for LocalHandle<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.control().data()
    }
}

impl<T> Drop for LocalHandle<T> {
    fn drop(&mut self) {
        let control = unsafe { self.ptr.as_ref() };
        if control.drop_ephemeral(1) {
            let boxed = unsafe { Box::from_raw(self.ptr.as_ptr()) };
            unsafe { ControlBlock::destroy(boxed) };
        }
    }
}
