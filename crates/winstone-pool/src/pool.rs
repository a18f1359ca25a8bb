//! Bounded resource pool.
//!
//! Resources are created lazily through a [`ResourceFactory`] up to the
//! configured capacity and recycled through an idle list. When the pool is
//! at capacity with nothing idle, `acquire` blocks on a condition variable
//! until a resource is returned or `max_wait` elapses.
//!
//! # Invariants
//!
//! - `live <= capacity` at all times. `live` counts idle resources, resources
//!   on loan, and slots reserved for a creation in progress.
//! - A resource obtained from the pool is either idle or on loan, never both.
//! - Invalidated resources are destroyed and never return to the idle list.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{BoxError, PoolError, Result};

/// Creates, validates and destroys pooled resources.
pub trait ResourceFactory<T>: Send + Sync {
    /// Builds a new resource.
    fn create(&self) -> std::result::Result<T, BoxError>;

    /// Releases a resource's underlying handles.
    fn destroy(&self, resource: T) {
        drop(resource);
    }

    /// Returns false if a resource handed back by a caller must not be reused.
    fn validate(&self, _resource: &T) -> bool {
        true
    }
}

/// Sizing and timeout configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of live resources.
    pub capacity: usize,
    /// Idle resources kept through `drain`.
    pub min_idle: usize,
    /// Idle resources above this count are destroyed on `release`.
    pub max_idle: usize,
    /// How long `acquire` waits when the pool is exhausted.
    pub max_wait: Duration,
}

impl PoolConfig {
    /// A config with `capacity` resources and defaults for the rest.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            min_idle: 0,
            max_idle: capacity,
            max_wait: Duration::from_secs(30),
        }
    }

    pub fn with_min_idle(mut self, min_idle: usize) -> Self {
        self.min_idle = min_idle;
        self
    }

    pub fn with_max_idle(mut self, max_idle: usize) -> Self {
        self.max_idle = max_idle;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Clamps the idle bounds into `min_idle <= max_idle <= capacity`.
    fn normalized(mut self) -> Self {
        self.max_idle = self.max_idle.min(self.capacity);
        self.min_idle = self.min_idle.min(self.max_idle);
        self
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Resources waiting in the idle list.
    pub idle: usize,
    /// Resources currently on loan.
    pub in_use: usize,
    /// Idle + on loan + creations in progress.
    pub live: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Resources created since the pool was built.
    pub created: u64,
    /// Resources destroyed since the pool was built.
    pub destroyed: u64,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    in_use: usize,
    live: usize,
    closed: bool,
    created: u64,
    destroyed: u64,
}

/// A bounded pool of reusable resources.
pub struct ResourcePool<T> {
    config: PoolConfig,
    factory: Box<dyn ResourceFactory<T>>,
    state: Mutex<PoolState<T>>,
    returned: Condvar,
}

impl<T> ResourcePool<T> {
    /// Creates an empty pool. Resources are built on demand.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is 0.
    pub fn new(config: PoolConfig, factory: impl ResourceFactory<T> + 'static) -> Self {
        assert!(config.capacity > 0, "pool capacity must be positive");
        Self {
            config: config.normalized(),
            factory: Box::new(factory),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(config.capacity),
                in_use: 0,
                live: 0,
                closed: false,
                created: 0,
                destroyed: 0,
            }),
            returned: Condvar::new(),
        }
    }

    /// The pool's configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes an idle resource, creates one if below capacity, or waits up
    /// to `max_wait` for one to be returned.
    pub fn acquire(&self) -> Result<T> {
        let deadline = Instant::now() + self.config.max_wait;
        let mut state = self.state();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(resource) = state.idle.pop_front() {
                state.in_use += 1;
                return Ok(resource);
            }

            if state.live < self.config.capacity {
                state.live += 1;
                drop(state);
                return self.create_reserved();
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(capacity = self.config.capacity, "resource pool exhausted");
                return Err(PoolError::PoolExhausted {
                    capacity: self.config.capacity,
                    waited: self.config.max_wait,
                });
            }
            state = self
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Acquires a resource wrapped in a guard that returns it on drop.
    pub fn acquire_guard(&self) -> Result<PooledResource<'_, T>> {
        Ok(PooledResource {
            pool: self,
            resource: Some(self.acquire()?),
        })
    }

    /// Returns a resource to the idle list.
    ///
    /// Resources the factory rejects, or any returned after `close`, are
    /// destroyed. Idle resources above `max_idle` are destroyed, oldest
    /// first.
    pub fn release(&self, resource: T) {
        if self.factory.validate(&resource) {
            self.restore(resource);
        } else {
            debug!("returned resource failed validation");
            self.invalidate(resource);
        }
    }

    /// Destroys a resource on loan instead of returning it.
    pub fn invalidate(&self, resource: T) {
        {
            let mut state = self.state();
            state.in_use = state.in_use.saturating_sub(1);
            state.live = state.live.saturating_sub(1);
            state.destroyed += 1;
        }
        self.returned.notify_one();
        self.factory.destroy(resource);
    }

    /// Runs `probe` over every resource idle at the time of the call.
    ///
    /// Each resource is checked out for the duration of its probe so a
    /// concurrent `acquire` can never receive it mid-probe. A probe
    /// returning false invalidates the resource. Returns the number probed.
    pub fn apply_on_idle<F>(&self, mut probe: F) -> usize
    where
        F: FnMut(&mut T) -> bool,
    {
        let rounds = self.state().idle.len();
        let mut probed = 0;

        for _ in 0..rounds {
            let mut resource = {
                let mut state = self.state();
                match state.idle.pop_front() {
                    Some(resource) => {
                        state.in_use += 1;
                        resource
                    }
                    None => break,
                }
            };

            probed += 1;
            if probe(&mut resource) {
                self.restore(resource);
            } else {
                self.invalidate(resource);
            }
        }
        probed
    }

    /// Destroys idle resources beyond `min_idle`, returning how many.
    pub fn drain(&self) -> usize {
        let drained: Vec<T> = {
            let mut state = self.state();
            let excess = state.idle.len().saturating_sub(self.config.min_idle);
            let drained: Vec<T> = state.idle.drain(..excess).collect();
            state.live -= drained.len();
            state.destroyed += drained.len() as u64;
            drained
        };

        let count = drained.len();
        if count > 0 {
            self.returned.notify_all();
            debug!(count, "drained idle resources");
        }
        for resource in drained {
            self.factory.destroy(resource);
        }
        count
    }

    /// Destroys every idle resource and refuses further acquires.
    ///
    /// Resources on loan are destroyed as they are returned.
    pub fn close(&self) {
        let idle: Vec<T> = {
            let mut state = self.state();
            state.closed = true;
            let idle: Vec<T> = state.idle.drain(..).collect();
            state.live -= idle.len();
            state.destroyed += idle.len() as u64;
            idle
        };
        self.returned.notify_all();
        for resource in idle {
            self.factory.destroy(resource);
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use,
            live: state.live,
            capacity: self.config.capacity,
            created: state.created,
            destroyed: state.destroyed,
        }
    }

    /// Builds a resource for a slot already reserved in `live`.
    fn create_reserved(&self) -> Result<T> {
        match self.factory.create() {
            Ok(resource) => {
                let mut state = self.state();
                state.in_use += 1;
                state.created += 1;
                Ok(resource)
            }
            Err(e) => {
                self.state().live -= 1;
                self.returned.notify_one();
                warn!(error = %e, "pooled resource construction failed");
                Err(PoolError::ConstructionFailure(e.to_string()))
            }
        }
    }

    /// Puts a loaned resource back without validating it.
    fn restore(&self, resource: T) {
        let mut destroy = Vec::new();
        {
            let mut state = self.state();
            state.in_use = state.in_use.saturating_sub(1);
            if state.closed {
                state.live = state.live.saturating_sub(1);
                state.destroyed += 1;
                destroy.push(resource);
            } else {
                state.idle.push_back(resource);
                while state.idle.len() > self.config.max_idle {
                    if let Some(excess) = state.idle.pop_front() {
                        state.live -= 1;
                        state.destroyed += 1;
                        destroy.push(excess);
                    }
                }
            }
        }
        self.returned.notify_one();
        for resource in destroy {
            self.factory.destroy(resource);
        }
    }

    // Factory callbacks never run under this lock, so a poisoned guard
    // still holds consistent counters.
    fn state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A resource on loan from a [`ResourcePool`], returned on drop.
pub struct PooledResource<'a, T> {
    pool: &'a ResourcePool<T>,
    resource: Option<T>,
}

impl<T> PooledResource<'_, T> {
    /// Destroys the resource instead of returning it to the pool.
    pub fn invalidate(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.invalidate(resource);
        }
    }
}

impl<T> Deref for PooledResource<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `invalidate` and `drop` take the resource, and both consume
        // the guard.
        self.resource.as_ref().expect("pooled resource already taken")
    }
}

impl<T> DerefMut for PooledResource<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.resource.as_mut().expect("pooled resource already taken")
    }
}

impl<T> Drop for PooledResource<'_, T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
