//! Padding to a cache line, used throughout the reclaimer to keep
//! independently-updated atomics (per-thread counters, proxy head/tail,
//! hazard-pointer node headers) from false-sharing a line with their
//! neighbors.

use std::fmt;
use std::ops::{Deref, DerefMut};

// 64 bytes covers essentially every desktop/server x86_64 and aarch64 part;
// wider lines (e.g. some POWER cores) just cost an extra, harmless padding
// step.
const CACHE_LINE_BYTES: usize = 64;

#[repr(align(64))]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub fn new(value: T) -> CachePadded<T> {
        CachePadded { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Default> Default for CachePadded<T> {
    fn default() -> CachePadded<T> {
        CachePadded::new(T::default())
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachePadded").field("value", &self.value).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem;

    #[test]
    fn is_at_least_a_cache_line() {
        assert!(mem::size_of::<CachePadded<u8>>() >= CACHE_LINE_BYTES);
    }

    #[test]
    fn derefs_to_inner() {
        let p = CachePadded::new(42u32);
        assert_eq!(*p, 42);
    }
}
