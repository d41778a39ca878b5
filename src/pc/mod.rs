//! Proxy Collector: a lock-free chain of epoch nodes shared by the RCPC
//! and STPC variants. Each node accumulates
//! references taken during its tenure as the chain's tail; a deferred
//! deletion attached to a node fires once that node's reference count
//! drops to zero, at which point the chain cascades into retiring however
//! many subsequent already-zero nodes follow it.
//!
//! Grounded on `original_source/rcpc/{rcpc.h,rcpc.c}` and
//! `original_source/stpc/{stpc.h,stpc.c}`.

pub mod rcpc;
pub mod stpc;

pub use rcpc::{Rcpc, RcpcConfig, RcpcNodeRef, RcpcStatsSnapshot};
pub use stpc::{Stpc, StpcConfig, StpcNodeRef, StpcStatsSnapshot};

/// Action a `defer_delete` call schedules. Replaces the source's
/// `(free_fn, data)` pair with a single closure — idiomatic for a language
/// with first-class closures instead of a function-pointer-plus-void-star
/// pairing.
pub type DeferredAction = Box<dyn FnOnce() + Send>;

pub(crate) const GUARD_UNIT: i64 = 1;
pub(crate) const REFERENCE_UNIT: i64 = 2;
