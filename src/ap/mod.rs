//! Differentially-counted atomic refcounted pointer.
//!
//! ```
//! use reclaim::ap::AtomicSlot;
//!
//! let slot = AtomicSlot::new(1);
//! {
//!     let handle = slot.load().unwrap();
//!     assert_eq!(*handle, 1);
//! }
//! slot.store(Some(reclaim::ap::LocalHandle::new(2)));
//! assert_eq!(*slot.load().unwrap(), 2);
//! ```
//!
//! Grounded on `original_source/atomic-ptr/atomic_ptr.h`'s
//! `differentialReference<T>` and `refcount` types for the refcount
//! protocol. The handle triad below (`AtomicSlot` / `LocalHandle` /
//! `ControlBlock`) keeps `mem::epoch`'s shape of a shareable cell plus a
//! scoped, Deref-able guard, generalized from epoch-based reclamation to
//! differential refcounting.

mod control;
mod slot;

pub use control::{ControlBlock, LocalHandle, RecycleFn};
pub use slot::AtomicSlot;
