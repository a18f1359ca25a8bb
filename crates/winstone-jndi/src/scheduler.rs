//! Single-threaded fixed-rate scheduler for resource maintenance.
//!
//! One named background thread runs every registered task at its period.
//! A failing or panicking task is logged and rescheduled; it never takes
//! the thread down. `shutdown_now` drops all pending tasks without waiting
//! for the one currently running, if any, to finish.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};
use winstone_pool::BoxError;

use crate::error::{JndiError, Result};

type Job = Arc<dyn Fn() -> std::result::Result<(), BoxError> + Send + Sync>;

struct Task {
    id: u64,
    name: String,
    period: Duration,
    next_run: Instant,
    job: Job,
}

#[derive(Default)]
struct State {
    tasks: Vec<Task>,
    next_id: u64,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    // Jobs run outside the lock, so the state is consistent even when a
    // thread panicked while holding it.
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    shared: Weak<Shared>,
}

impl TaskHandle {
    /// Removes the task from the schedule. Returns false if it was already
    /// cancelled or the scheduler is gone.
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state();
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != self.id);
        let removed = state.tasks.len() != before;
        drop(state);
        shared.wakeup.notify_one();
        removed
    }
}

/// A fixed-rate task scheduler backed by one thread.
pub struct Scheduler {
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    /// Starts the scheduler thread.
    pub fn start(thread_name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.to_owned())
            .spawn(move || run(&worker))
            .map_err(|source| JndiError::Spawn {
                what: "scheduler thread",
                source,
            })?;

        Ok(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Runs `job` every `period`, first after `initial_delay`.
    ///
    /// Returns `None` once the scheduler has been shut down.
    pub fn schedule_at_fixed_rate<F>(
        &self,
        name: impl Into<String>,
        initial_delay: Duration,
        period: Duration,
        job: F,
    ) -> Option<TaskHandle>
    where
        F: Fn() -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        let mut state = self.shared.state();
        if state.shutdown {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        let name = name.into();
        debug!(task = %name, ?period, "scheduled task");
        state.tasks.push(Task {
            id,
            name,
            period: period.max(Duration::from_millis(1)),
            next_run: Instant::now() + initial_delay,
            job: Arc::new(job),
        });
        drop(state);
        self.shared.wakeup.notify_one();

        Some(TaskHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// Number of tasks currently scheduled.
    pub fn pending(&self) -> usize {
        self.shared.state().tasks.len()
    }

    /// Returns true once `shutdown_now` has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shared.state().shutdown
    }

    /// Stops the scheduler, dropping every pending task. Returns how many
    /// were dropped.
    ///
    /// A task already running is not waited for; the thread exits as soon
    /// as it returns.
    pub fn shutdown_now(&self) -> usize {
        let dropped = {
            let mut state = self.shared.state();
            if state.shutdown {
                return 0;
            }
            state.shutdown = true;
            std::mem::take(&mut state.tasks).len()
        };
        self.shared.wakeup.notify_all();

        // Detach rather than join.
        drop(
            self.handle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        debug!(dropped, "scheduler shut down");
        dropped
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state();
    loop {
        if state.shutdown {
            return;
        }

        let now = Instant::now();
        let due = state
            .tasks
            .iter_mut()
            .filter(|t| t.next_run <= now)
            .min_by_key(|t| t.next_run);

        if let Some(task) = due {
            // Fixed rate: the next run is anchored to the previous slot, but
            // a task that overran skips the missed slots.
            task.next_run += task.period;
            if task.next_run <= now {
                task.next_run = now + task.period;
            }
            let job = Arc::clone(&task.job);
            let name = task.name.clone();
            drop(state);
            run_job(&name, &job);
            state = shared.state();
            continue;
        }

        let wait = state.tasks.iter().map(|t| t.next_run).min();
        state = match wait {
            Some(at) => {
                shared
                    .wakeup
                    .wait_timeout(state, at.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => shared
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

fn run_job(name: &str, job: &Job) {
    match panic::catch_unwind(AssertUnwindSafe(|| job())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task = %name, error = %e, "scheduled task failed"),
        Err(_) => error!(task = %name, "scheduled task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> std::result::Result<(), BoxError> + Send + Sync) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn runs_task_repeatedly() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let (count, job) = counter();
        scheduler
            .schedule_at_fixed_rate("tick", Duration::ZERO, Duration::from_millis(10), job)
            .unwrap();

        thread::sleep(Duration::from_millis(200));
        assert!(count.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn cancelled_task_stops_running() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let (count, job) = counter();
        let handle = scheduler
            .schedule_at_fixed_rate("tick", Duration::ZERO, Duration::from_millis(10), job)
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert!(handle.cancel());
        assert!(!handle.cancel());
        thread::sleep(Duration::from_millis(20));
        let seen = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), seen);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn failing_task_keeps_thread_alive() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        scheduler
            .schedule_at_fixed_rate("fails", Duration::ZERO, Duration::from_millis(5), || {
                Err("probe failed".into())
            })
            .unwrap();
        scheduler
            .schedule_at_fixed_rate("panics", Duration::ZERO, Duration::from_millis(5), || {
                panic!("boom")
            })
            .unwrap();
        let (count, job) = counter();
        scheduler
            .schedule_at_fixed_rate("tick", Duration::ZERO, Duration::from_millis(5), job)
            .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert!(count.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn shutdown_now_drops_pending_tasks() {
        let scheduler = Scheduler::start("test-scheduler").unwrap();
        let (count, job) = counter();
        scheduler
            .schedule_at_fixed_rate("later", Duration::from_secs(60), Duration::from_secs(60), job)
            .unwrap();

        assert_eq!(scheduler.shutdown_now(), 1);
        assert!(scheduler.is_shutdown());
        assert_eq!(scheduler.shutdown_now(), 0);
        assert!(
            scheduler
                .schedule_at_fixed_rate("rejected", Duration::ZERO, Duration::from_secs(1), || Ok(()))
                .is_none()
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
