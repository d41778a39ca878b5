//! SMR: hazard-pointer-protected reads plus a background poller thread
//! that reclaims deferred work once it's provably unreachable.
//!
//! Grounded on `original_source/fastsmr/{fastsmr.h,fastsmr.c,smrscan.c,
//! fifo.c}`. Where `ap` and `pc` give a single shared cell its own
//! bespoke refcounting protocol, `smr` is the general-purpose fallback:
//! any number of readers each protect up to two pointers at a time with
//! [`Reclaimer::protect`], and any number of writers hand off cleanup
//! work with [`Reclaimer::defer_fifo`] or [`Reclaimer::defer_trace`]
//! without needing a bespoke control-block type for what they're
//! protecting.
//!
//! ```
//! use reclaim::smr::default_reclaimer;
//!
//! let mut value = Box::new(41);
//! let ptr: *mut i32 = &mut *value;
//! std::mem::forget(value);
//!
//! {
//!     let _guard = default_reclaimer().protect(ptr);
//!     // `ptr` is safe to dereference for as long as `_guard` lives.
//! }
//!
//! default_reclaimer().defer_fifo(ptr, move || unsafe {
//!     drop(Box::from_raw(ptr));
//! });
//! ```

mod defer;
mod hazard;
mod poller;
mod queue;
mod reclaimer;

pub use hazard::HazardGuard;
pub use reclaimer::{default_reclaimer, Reclaimer, SmrConfig, SmrStatsSnapshot};
