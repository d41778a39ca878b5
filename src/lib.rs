//! Differential atomic refcounting, proxy-collector, and hazard-pointer
//! SMR memory reclamation for lock-free data structures.
//!
//! Three independent schemes, each trading off differently between
//! per-object overhead, reclamation latency, and how much a caller needs
//! to know about what it's protecting:
//!
//! - [`ap`]: an atomic refcounted pointer cell (`AtomicSlot<T>`) for a
//!   single shared slot, reclaiming as soon as the last reference drops.
//! - [`pc`]: a proxy collector (`Rcpc`/`Stpc`) batching many objects'
//!   deferred deletions behind one shared epoch chain.
//! - [`smr`]: hazard pointers plus a background poller, for readers that
//!   protect raw pointers directly rather than going through a slot type.
//!
//! See `DESIGN.md` for how each module is grounded.

pub mod ap;
pub mod pc;
pub mod smr;

mod backoff;
mod cache_padded;
mod config;

pub use backoff::default_backoff;
pub use cache_padded::CachePadded;
pub use config::ConfigError;
