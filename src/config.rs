//! Configuration-time errors. This is the only fallible, `Result`-returning
//! surface in the crate: everything past `build()` — reader loads, writer
//! defers, hazard-pointer publish — is infallible by contract.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("latency must be at least 1, got {0}")]
    LatencyTooSmall(u32),

    #[error("max_nodes must be at least 2 (a tail and a free node), got {0}")]
    MaxNodesTooSmall(usize),

    #[error("min_wait must be nonzero")]
    MinWaitZero,
}
