//! # winstone-pool: bounded resource pooling
//!
//! A generic pool of reusable, expensively constructed resources such as
//! database connections. The pool owns a [`ResourceFactory`] that knows how
//! to build, validate and tear down a resource; callers `acquire` a
//! resource, use it, and `release` or `invalidate` it.
//!
//! ```
//! use std::time::Duration;
//! use winstone_pool::{BoxError, PoolConfig, ResourceFactory, ResourcePool};
//!
//! struct Numbers;
//!
//! impl ResourceFactory<u32> for Numbers {
//!     fn create(&self) -> Result<u32, BoxError> {
//!         Ok(7)
//!     }
//! }
//!
//! let pool = ResourcePool::new(
//!     PoolConfig::new(2).with_max_wait(Duration::from_millis(10)),
//!     Numbers,
//! );
//! let n = pool.acquire().unwrap();
//! pool.release(n);
//! assert_eq!(pool.stats().idle, 1);
//! ```

mod error;
mod pool;

pub use error::{BoxError, PoolError, Result};
pub use pool::{PoolConfig, PoolStats, PooledResource, ResourceFactory, ResourcePool};

#[cfg(test)]
mod tests;
