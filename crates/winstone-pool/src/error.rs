//! Pool error types.

use std::time::Duration;

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Error type returned by [`ResourceFactory::create`](crate::ResourceFactory::create).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while acquiring pooled resources.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every resource is in use and none was returned within the wait limit.
    #[error("pool exhausted: {capacity} resources in use, waited {waited:?}")]
    PoolExhausted { capacity: usize, waited: Duration },

    /// The factory failed to create a resource.
    #[error("failed to construct pooled resource: {0}")]
    ConstructionFailure(String),

    /// The pool has been closed.
    #[error("pool closed")]
    Closed,
}

impl PoolError {
    /// Returns true if this is a `PoolExhausted` error.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
