//! The shareable, atomically updatable pointer cell.
//!
//! The differential pointer slot is `{ ephemeral_delta, control_block }`
//! packed into one `AtomicU64`: the low 48 bits hold the pointer, the high
//! 16 bits hold the delta. This is the "64-bit-pointer-with-stolen-bits"
//! fallback the design notes call out as an accepted alternative to a
//! 16-byte CAS — chosen here because it needs no platform-conditional
//! unsafe assembly (`mem::epoch::exclusive_x64::cas_tagged`'s own attempt
//! at a `cmpxchg16b` helper uses inline `asm!` syntax that does not
//! compile on stable Rust). It does cap managed objects to the
//! low 48 bits of the address space, which covers every mainstream 64-bit
//! userspace layout.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use cfg_if::cfg_if;

use super::control::{ControlBlock, LocalHandle};

cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        // The packed-word scheme below only makes sense with 64-bit
        // pointers to spare bits from.
    } else {
        compile_error!("reclaim::ap requires a 64-bit target (the slot packs a pointer and a delta into one AtomicU64)");
    }
}

const PTR_BITS: u32 = 48;
const PTR_MASK: u64 = (1u64 << PTR_BITS) - 1;
const MAX_DELTA: u16 = u16::MAX;

fn encode(delta: u16, ptr: *mut ()) -> u64 {
    let addr = ptr as u64;
    debug_assert_eq!(addr & !PTR_MASK, 0, "control block address exceeds 48 bits");
    addr | ((delta as u64) << PTR_BITS)
}

fn decode(word: u64) -> (u16, *mut ()) {
    let delta = (word >> PTR_BITS) as u16;
    let ptr = (word & PTR_MASK) as *mut ();
    (delta, ptr)
}

/// Shareable, atomically updatable pointer cell holding (at most) one
/// `ControlBlock<T>` at a time.
pub struct AtomicSlot<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut ControlBlock<T>>,
}

unsafe impl<T: Send + Sync> Send for AtomicSlot<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicSlot<T> {}

impl<T> AtomicSlot<T> {
    pub fn null() -> AtomicSlot<T> {
        AtomicSlot { word: AtomicU64::new(0), _marker: PhantomData }
    }

    pub fn new(value: T) -> AtomicSlot<T> {
        let slot = AtomicSlot::null();
        slot.store(Some(LocalHandle::new(value)));
        slot
    }

    fn raw_ptr(ptr: *mut ()) -> Option<NonNull<ControlBlock<T>>> {
        NonNull::new(ptr as *mut ControlBlock<T>)
    }

    /// Read fast path: CAS-increments the slot's `ephemeral_delta`,
    /// borrowing one ephemeral unit against whatever control block is
    /// currently installed, then returns a handle over it.
    pub fn load(&self) -> Option<LocalHandle<T>> {
        loop {
            let old_word = self.word.load(Ordering::Acquire);
            let (delta, ptr) = decode(old_word);
            let control = Self::raw_ptr(ptr)?;
            assert!(delta < MAX_DELTA, "AP slot ephemeral delta overflow — too many concurrent readers");
            let new_word = encode(delta + 1, ptr as *mut ());
            if self
                .word
                .compare_exchange_weak(old_word, new_word, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(unsafe { LocalHandle::from_raw_claimed(control) });
            }
        }
    }

    /// Installs `new`, discarding whatever was there before.
    pub fn store(&self, new: Option<LocalHandle<T>>) {
        let _old = self.exchange(new);
    }

    /// Installs `new`, returning a handle over whatever was there before.
    pub fn swap(&self, new: Option<LocalHandle<T>>) -> Option<LocalHandle<T>> {
        self.exchange(new)
    }

    /// `expected` is a pure identity witness: its ownership is untouched
    /// regardless of outcome. On success `new` is consumed into the slot.
    /// On failure `new` is handed back to the caller, avoiding the
    /// leaked-control-block bug noted against the original `cas` (see
    /// `DESIGN.md`).
    pub fn cas(
        &self,
        expected: &Option<LocalHandle<T>>,
        new: Option<LocalHandle<T>>,
    ) -> Result<(), Option<LocalHandle<T>>> {
        let expected_ptr = expected.as_ref().map(|h| h.as_ptr()).unwrap_or(std::ptr::null_mut());
        loop {
            let old_word = self.word.load(Ordering::Acquire);
            let (delta, ptr) = decode(old_word);
            if ptr as *mut ControlBlock<T> != expected_ptr {
                return Err(new);
            }
            let new_ptr = match &new {
                Some(h) => h.as_ptr() as *mut (),
                None => std::ptr::null_mut(),
            };
            let new_word = encode(0, new_ptr);
            match self.word.compare_exchange_weak(old_word, new_word, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    if let Some(handle) = new {
                        handle.into_reference_ptr();
                    }
                    if let Some(old_control) = Self::raw_ptr(ptr) {
                        self.reconcile_displaced(old_control, delta, false);
                    }
                    return Ok(());
                }
                Err(_) => continue,
            }
        }
    }

    /// Pointer-identity comparison without materializing a handle.
    pub fn compare_to(&self, other: &LocalHandle<T>) -> bool {
        let (_, ptr) = decode(self.word.load(Ordering::Acquire));
        ptr as *mut ControlBlock<T> == other.as_ptr()
    }

    fn exchange(&self, new: Option<LocalHandle<T>>) -> Option<LocalHandle<T>> {
        let new_ptr = match &new {
            Some(h) => h.as_ptr() as *mut (),
            None => std::ptr::null_mut(),
        };
        let new_word = encode(0, new_ptr);
        let old_word = self.word.swap(new_word, Ordering::AcqRel);
        if let Some(handle) = new {
            handle.into_reference_ptr();
        }
        let (delta, ptr) = decode(old_word);
        let old_control = Self::raw_ptr(ptr)?;
        // Hand the displaced object back to the caller as a fresh
        // ephemeral claim, in addition to reconciling the slot's own
        // persistent claim and accumulated delta.
        self.reconcile_displaced(old_control, delta, true)
    }

    fn reconcile_displaced(
        &self,
        old_control: NonNull<ControlBlock<T>>,
        delta: u16,
        hand_back: bool,
    ) -> Option<LocalHandle<T>> {
        let control = unsafe { old_control.as_ref() };
        let extra = if hand_back { 1 } else { 0 };
        // One combined RMW: add back the borrowed ephemeral units (plus one
        // more if we're handing the object back to the caller) and drop
        // the slot's own persistent reference.
        let freed = control.reconcile_displaced(delta as i64 + extra, 1);
        if hand_back {
            Some(unsafe { LocalHandle::from_raw_claimed(old_control) })
        } else {
            if freed {
                let boxed = unsafe { Box::from_raw(old_control.as_ptr()) };
                unsafe { ControlBlock::destroy(boxed) };
            }
            None
        }
    }
}

impl<T> Drop for AtomicSlot<T> {
    fn drop(&mut self) {
        self.store(None);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn store_then_load_round_trips() {
        let slot = AtomicSlot::new(41);
        let h = slot.load().unwrap();
        assert_eq!(*h, 41);
    }

    #[test]
    fn swap_returns_previous_and_installs_new() {
        let slot = AtomicSlot::new(1);
        let old = slot.swap(Some(LocalHandle::new(2))).unwrap();
        assert_eq!(*old, 1);
        drop(old);
        assert_eq!(*slot.load().unwrap(), 2);
    }

    #[test]
    fn cas_fails_on_mismatch_and_returns_new() {
        let slot = AtomicSlot::new(1);
        let stale = LocalHandle::new(999);
        let new = LocalHandle::new(2);
        let result = slot.cas(&Some(stale), new);
        assert!(result.is_err());
        assert_eq!(*slot.load().unwrap(), 1);
    }

    #[test]
    fn cas_succeeds_on_match() {
        let slot = AtomicSlot::new(1);
        let current = slot.load().unwrap();
        let result = slot.cas(&Some(current), LocalHandle::new(2));
        assert!(result.is_ok());
        assert_eq!(*slot.load().unwrap(), 2);
    }

    #[test]
    fn destructor_runs_exactly_once_per_swap() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;

        struct Counted(Arc<AtomicUsize>);
        impl Drop for Counted {
            fn drop(&mut self) {
                self.0.fetch_add(1, O::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let slot = AtomicSlot::new(Counted(drops.clone()));
        for _ in 0..500 {
            slot.store(Some(LocalHandle::new(Counted(drops.clone()))));
        }
        drop(slot);
        assert_eq!(drops.load(O::SeqCst), 501);
    }

    #[test]
    fn four_readers_never_see_a_freed_object() {
        use std::sync::atomic::{AtomicUsize, Ordering as O};
        use std::sync::Arc;

        struct Seq {
            seq: usize,
            destroyed: Arc<AtomicUsize>,
        }
        impl Drop for Seq {
            fn drop(&mut self) {
                self.destroyed.fetch_add(1, O::SeqCst);
            }
        }

        let destroyed = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(AtomicSlot::new(Seq { seq: 1, destroyed: destroyed.clone() }));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let slot = slot.clone();
                scope.spawn(move || {
                    let mut last = 0;
                    for _ in 0..2000 {
                        if let Some(h) = slot.load() {
                            assert!(h.seq >= last);
                            last = h.seq;
                        }
                    }
                });
            }

            let writer_slot = slot.clone();
            let writer_destroyed = destroyed.clone();
            scope.spawn(move || {
                for n in 2..=500 {
                    writer_slot.store(Some(LocalHandle::new(Seq { seq: n, destroyed: writer_destroyed.clone() })));
                }
            });
        });

        drop(slot);
        assert_eq!(destroyed.load(O::SeqCst), 500);
    }
}
