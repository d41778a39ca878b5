//! Caller-supplied backoff for the handful of spots (PC's `defer_delete`,
//! SMR's slot/node pool exhaustion) where a CAS loop would otherwise spin
//! hot under contention. The reclaimer never chooses a backoff policy for
//! the caller; it only calls back into one.

use std::thread;
use std::time::Duration;

/// Signature every `backoff_fn` parameter in the public API takes:
/// the number of failed attempts so far for the current operation.
pub type BackoffFn<'a> = dyn FnMut(u32) + 'a;

/// A reasonable default: spin briefly, then yield, then sleep for
/// increasing (capped) intervals. Good enough for tests and for callers
/// who do not have a more specific policy of their own.
pub fn default_backoff(attempt: u32) {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;

    if attempt <= SPIN_LIMIT {
        for _ in 0..(1u32 << attempt) {
            std::hint::spin_loop();
        }
    } else if attempt <= YIELD_LIMIT {
        thread::yield_now();
    } else {
        let millis = (attempt - YIELD_LIMIT).min(20) as u64;
        thread::sleep(Duration::from_micros(millis * 100));
    }
}
