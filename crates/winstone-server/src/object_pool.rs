//! Pooled request handler threads, requests and responses.
//!
//! # Design
//!
//! - Handler threads are started eagerly up to `handler_count_startup` and
//!   spawned on demand up to `handler_count_max`. A connection arriving
//!   when every handler is busy waits one `retry_period` and tries once
//!   more before it is refused.
//! - A sweep thread retires idle handlers above `handler_count_max_idle`.
//! - Requests and responses are recycled through lock-free bounded queues.
//!   Exhaustion fails the one request immediately: the listener answers it
//!   through `Listener::reject` and the connection stays open.

use std::collections::HashMap;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SendError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use winstone_config::WinstoneConfig;

use crate::error::{ServerError, ServerResult};
use crate::listener::{KeepAlive, Listener};
use crate::request::{Request, Response, UNIQUE_ID_ATTRIBUTE};
use crate::signal::StopSignal;

/// Sizing of an [`ObjectPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPoolConfig {
    pub handler_count_startup: usize,
    pub handler_count_max: usize,
    pub handler_count_max_idle: usize,
    pub request_pool_max: usize,
    pub response_pool_max: usize,
    /// Pause before retrying a connection no handler could take.
    pub retry_period: Duration,
    /// Interval of the idle handler trim.
    pub sweep_period: Duration,
    /// Tag every request with a `UNIQUE_ID` attribute.
    pub simulate_mod_unique_id: bool,
}

impl Default for ObjectPoolConfig {
    fn default() -> Self {
        Self::from_config(&WinstoneConfig::default())
    }
}

impl ObjectPoolConfig {
    pub fn from_config(config: &WinstoneConfig) -> Self {
        Self {
            handler_count_startup: config.handler_count_startup as usize,
            handler_count_max: config.handler_count_max as usize,
            handler_count_max_idle: config.handler_count_max_idle as usize,
            request_pool_max: config.request_pool_max as usize,
            response_pool_max: config.response_pool_max as usize,
            retry_period: config.retry_period(),
            sweep_period: config.sweep_period(),
            simulate_mod_unique_id: config.simulate_mod_unique_id,
        }
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectPoolStats {
    pub handlers_idle: usize,
    pub handlers_busy: usize,
    pub requests_idle: usize,
    pub requests_live: usize,
    pub responses_idle: usize,
    pub responses_live: usize,
    /// Connections refused because no handler was free.
    pub refused: u64,
    /// Requests answered through `Listener::reject` because no request or
    /// response object was free.
    pub rejected: u64,
}

/// A bounded free list that creates objects on demand up to `max`.
struct Recycler<T> {
    name: &'static str,
    idle: ArrayQueue<T>,
    live: AtomicUsize,
}

impl<T> Recycler<T> {
    fn new(name: &'static str, max: usize) -> Self {
        assert!(max > 0, "{name} pool size must be positive");
        Self {
            name,
            idle: ArrayQueue::new(max),
            live: AtomicUsize::new(0),
        }
    }

    fn acquire(&self, create: impl FnOnce() -> T) -> ServerResult<T> {
        if let Some(object) = self.idle.pop() {
            return Ok(object);
        }
        let capacity = self.idle.capacity();
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < capacity).then_some(live + 1)
            })
            .map_err(|_| ServerError::PoolExhausted {
                pool: self.name,
                capacity,
            })?;
        Ok(create())
    }

    fn release(&self, object: T) {
        // Only objects counted in `live` come back, so the queue has room.
        if self.idle.push(object).is_err() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

struct Job {
    socket: TcpStream,
    listener: Arc<dyn Listener>,
}

struct Handler {
    jobs: Sender<Job>,
    thread: JoinHandle<()>,
}

#[derive(Default)]
struct Handlers {
    idle: Vec<(usize, Handler)>,
    busy: HashMap<usize, Handler>,
    next_id: usize,
    closed: bool,
}

impl Handlers {
    fn live(&self) -> usize {
        self.idle.len() + self.busy.len()
    }
}

struct Inner {
    config: ObjectPoolConfig,
    handlers: Mutex<Handlers>,
    requests: Recycler<Request>,
    responses: Recycler<Response>,
    next_request_id: AtomicU64,
    refused: AtomicU64,
    rejected: AtomicU64,
    stop: StopSignal,
}

/// The three pools shared by every listener.
pub struct ObjectPool {
    inner: Arc<Inner>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ObjectPool {
    /// Starts `handler_count_startup` handler threads and the idle sweep.
    ///
    /// # Panics
    ///
    /// Panics if `handler_count_max`, `request_pool_max` or
    /// `response_pool_max` is 0.
    pub fn new(config: ObjectPoolConfig) -> ServerResult<Self> {
        assert!(config.handler_count_max > 0, "handler_count_max must be positive");
        let inner = Arc::new(Inner {
            requests: Recycler::new("request", config.request_pool_max),
            responses: Recycler::new("response", config.response_pool_max),
            handlers: Mutex::new(Handlers::default()),
            next_request_id: AtomicU64::new(1),
            refused: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            stop: StopSignal::new(),
            config,
        });

        // From here on, an early return drops the pool and stops whatever
        // was started.
        let pool = Self {
            inner,
            sweeper: Mutex::new(None),
        };

        let startup = pool.inner.config.handler_count_startup.min(pool.inner.config.handler_count_max);
        for _ in 0..startup {
            let mut handlers = pool.inner.handlers();
            let spawned = pool.inner.spawn_handler(&mut handlers)?;
            handlers.idle.push(spawned);
        }

        let worker = Arc::clone(&pool.inner);
        let sweeper = thread::Builder::new()
            .name("winstone-pool-sweep".into())
            .spawn(move || worker.sweep_loop())?;
        *pool.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);

        info!(
            startup,
            max = pool.inner.config.handler_count_max,
            max_idle = pool.inner.config.handler_count_max_idle,
            "object pool started"
        );
        Ok(pool)
    }

    pub fn config(&self) -> &ObjectPoolConfig {
        &self.inner.config
    }

    /// Hands `socket` to a free handler thread.
    ///
    /// When every handler is busy and no more may be spawned, waits one
    /// retry period and tries once more. If that fails too, the listener's
    /// `refuse` gets the socket.
    pub fn handle_request(&self, socket: TcpStream, listener: Arc<dyn Listener>) {
        let job = match self.inner.dispatch(Job { socket, listener }) {
            Ok(()) => return,
            Err(job) => job,
        };

        debug!(
            listener = job.listener.name(),
            retry_ms = self.inner.config.retry_period.as_millis() as u64,
            "no free request handler, retrying"
        );
        thread::sleep(self.inner.config.retry_period);

        if let Err(job) = self.inner.dispatch(job) {
            self.inner.refused.fetch_add(1, Ordering::Relaxed);
            let error = ServerError::PoolExhausted {
                pool: "handler",
                capacity: self.inner.config.handler_count_max,
            };
            warn!(listener = job.listener.name(), error = %error, "connection refused");
            job.listener.refuse(job.socket, &error);
        }
    }

    /// A clean request with a fresh id.
    pub fn acquire_request(&self) -> ServerResult<Request> {
        self.inner.acquire_request()
    }

    pub fn release_request(&self, request: Request) {
        self.inner.release_request(request);
    }

    pub fn acquire_response(&self) -> ServerResult<Response> {
        self.inner.responses.acquire(Response::new)
    }

    pub fn release_response(&self, response: Response) {
        self.inner.release_response(response);
    }

    /// Retires idle handlers above `handler_count_max_idle`. Returns how
    /// many were retired. Runs periodically on the sweep thread.
    pub fn trim_idle_handlers(&self) -> usize {
        self.inner.trim_idle_handlers()
    }

    pub fn stats(&self) -> ObjectPoolStats {
        let handlers = self.inner.handlers();
        ObjectPoolStats {
            handlers_idle: handlers.idle.len(),
            handlers_busy: handlers.busy.len(),
            requests_idle: self.inner.requests.idle.len(),
            requests_live: self.inner.requests.live.load(Ordering::Acquire),
            responses_idle: self.inner.responses.idle.len(),
            responses_live: self.inner.responses.live.load(Ordering::Acquire),
            refused: self.inner.refused.load(Ordering::Relaxed),
            rejected: self.inner.rejected.load(Ordering::Relaxed),
        }
    }

    /// Stops the sweep and every idle handler. Busy handlers exit once
    /// their connection closes. Safe to call more than once.
    pub fn destroy(&self) {
        self.inner.stop.stop();

        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if sweeper.join().is_err() {
                error!("object pool sweep thread panicked");
            }
        }

        let (idle, busy) = {
            let mut handlers = self.inner.handlers();
            if handlers.closed {
                return;
            }
            handlers.closed = true;
            (std::mem::take(&mut handlers.idle), handlers.busy.len())
        };
        let retired = idle.len();
        join_handlers(idle);
        info!(retired, busy, "object pool destroyed");
    }
}

impl Drop for ObjectPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ObjectPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Inner {
    // Handler bookkeeping is a handful of moves between collections; it
    // stays consistent under poisoning.
    fn handlers(&self) -> MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_handler(self: &Arc<Self>, handlers: &mut Handlers) -> ServerResult<(usize, Handler)> {
        let id = handlers.next_id;
        handlers.next_id += 1;

        let (jobs, rx) = mpsc::channel();
        let inner = Arc::clone(self);
        let thread = thread::Builder::new()
            .name(format!("winstone-handler-{id}"))
            .spawn(move || inner.handler_loop(id, &rx))?;
        debug!(handler = id, "request handler started");
        Ok((id, Handler { jobs, thread }))
    }

    fn handler_loop(&self, id: usize, jobs: &Receiver<Job>) {
        while let Ok(job) = jobs.recv() {
            self.serve_connection(job);
            if !self.handler_finished(id) {
                break;
            }
        }
        debug!(handler = id, "request handler exiting");
    }

    /// Gives `job` to an idle handler, spawning one if there is room.
    /// Returns the job if every handler is busy.
    fn dispatch(self: &Arc<Self>, job: Job) -> Result<(), Job> {
        let mut handlers = self.handlers();
        if handlers.closed {
            return Err(job);
        }

        let (id, handler) = match handlers.idle.pop() {
            Some(idle) => idle,
            None if handlers.live() < self.config.handler_count_max => {
                match self.spawn_handler(&mut handlers) {
                    Ok(spawned) => spawned,
                    Err(e) => {
                        error!(error = %e, "failed to spawn request handler");
                        return Err(job);
                    }
                }
            }
            None => return Err(job),
        };

        match handler.jobs.send(job) {
            Ok(()) => {
                handlers.busy.insert(id, handler);
                Ok(())
            }
            Err(SendError(job)) => {
                warn!(handler = id, "request handler gone, discarding it");
                Err(job)
            }
        }
    }

    /// Returns the handler to the idle list. False once the pool is
    /// closed, telling the handler to exit.
    fn handler_finished(&self, id: usize) -> bool {
        let mut handlers = self.handlers();
        let Some(handler) = handlers.busy.remove(&id) else {
            return false;
        };
        if handlers.closed {
            return false;
        }
        handlers.idle.push((id, handler));
        true
    }

    /// Serves requests on one connection until the listener closes it.
    ///
    /// When the request or response pool is exhausted only the request at
    /// hand fails: the listener's `reject` answers it and the connection
    /// carries on.
    fn serve_connection(&self, job: Job) {
        let Job {
            mut socket,
            listener,
        } = job;
        loop {
            let (mut request, mut response) = match self.acquire_pair() {
                Ok(pair) => pair,
                Err(e) => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    debug!(listener = listener.name(), error = %e, "request rejected");
                    let outcome =
                        panic::catch_unwind(AssertUnwindSafe(|| listener.reject(&mut socket, &e)));
                    if keep_alive(listener.as_ref(), outcome) {
                        continue;
                    }
                    return;
                }
            };
            if let Ok(addr) = socket.peer_addr() {
                request.set_remote_addr(addr);
            }
            if self.config.simulate_mod_unique_id {
                request.set_attribute(UNIQUE_ID_ATTRIBUTE, Uuid::new_v4().simple().to_string());
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.serve(&mut socket, &mut request, &mut response)
            }));
            self.release_request(request);
            self.release_response(response);
            if !keep_alive(listener.as_ref(), outcome) {
                return;
            }
        }
    }

    fn acquire_pair(&self) -> ServerResult<(Request, Response)> {
        let request = self.acquire_request()?;
        match self.responses.acquire(Response::new) {
            Ok(response) => Ok((request, response)),
            Err(e) => {
                self.release_request(request);
                Err(e)
            }
        }
    }

    fn acquire_request(&self) -> ServerResult<Request> {
        let mut request = self.requests.acquire(Request::new)?;
        request.begin(self.next_request_id.fetch_add(1, Ordering::Relaxed));
        Ok(request)
    }

    fn release_request(&self, mut request: Request) {
        request.cleanup();
        self.requests.release(request);
    }

    fn release_response(&self, mut response: Response) {
        response.cleanup();
        self.responses.release(response);
    }

    fn sweep_loop(&self) {
        while !self.stop.wait_timeout(self.config.sweep_period) {
            let retired = self.trim_idle_handlers();
            if retired > 0 {
                debug!(retired, "idle request handlers retired");
            }
        }
    }

    fn trim_idle_handlers(&self) -> usize {
        let excess = {
            let mut handlers = self.handlers();
            let keep = self.config.handler_count_max_idle;
            if handlers.idle.len() <= keep {
                return 0;
            }
            // Oldest first.
            let surplus = handlers.idle.len() - keep;
            handlers.idle.drain(..surplus).collect::<Vec<_>>()
        };
        let retired = excess.len();
        join_handlers(excess);
        retired
    }
}

/// Whether the connection stays open after a listener callback.
fn keep_alive(listener: &dyn Listener, outcome: std::thread::Result<std::io::Result<KeepAlive>>) -> bool {
    match outcome {
        Ok(Ok(KeepAlive::Continue)) => true,
        Ok(Ok(KeepAlive::Close)) => false,
        Ok(Err(e)) => {
            debug!(listener = listener.name(), error = %e, "connection closed");
            false
        }
        Err(_) => {
            error!(listener = listener.name(), "listener panicked, closing connection");
            false
        }
    }
}

/// Closes the job channels of idle handlers and waits for them to exit.
fn join_handlers(handlers: Vec<(usize, Handler)>) {
    for (id, Handler { jobs, thread }) in handlers {
        drop(jobs);
        if thread.join().is_err() {
            error!(handler = id, "request handler panicked");
        }
    }
}
