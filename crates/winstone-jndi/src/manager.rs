//! The JNDI manager: root context, resource binding and maintenance.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};
use winstone_naming::{BoundObject, CompositeName, NamingContext, NamingError, NamingValue};

use crate::datasource::{DataSourceConfig, DriverRegistry, PooledDataSource};
use crate::error::{JndiError, Result};
use crate::resources::{DefaultMailSessionFactory, MailSessionFactory, ObjectFactoryRegistry};
use crate::scheduler::{Scheduler, TaskHandle};

/// Subtree every data source is bound under.
pub const DATA_SOURCE_CONTEXT: &str = "jdbc";

const SCHEDULER_THREAD: &str = "winstone-jndi-scheduler";

enum State {
    Uninitialized,
    Running(Running),
    Destroyed,
}

struct Running {
    root: Arc<NamingContext>,
    scheduler: Scheduler,
    tasks: Vec<TaskHandle>,
}

/// Owns the `java:/comp/env` naming tree and the resources bound in it.
///
/// # Lifecycle
///
/// 1. `JndiManager::new()`, then register drivers and object factories.
/// 2. `initialize()` creates the root context and the scheduler thread.
/// 3. Bind resources with `bind_data_source`, `bind_mail_session`, `bind`.
/// 4. `destroy()` closes data sources, the root context and the scheduler.
///    The manager cannot be reinitialized afterwards.
pub struct JndiManager {
    drivers: Arc<DriverRegistry>,
    object_factories: ObjectFactoryRegistry,
    mail_factory: Box<dyn MailSessionFactory>,
    state: Mutex<State>,
}

impl Default for JndiManager {
    fn default() -> Self {
        Self::new()
    }
}

impl JndiManager {
    pub fn new() -> Self {
        Self::with_drivers(Arc::new(DriverRegistry::new()))
    }

    /// A manager sharing an existing driver table.
    pub fn with_drivers(drivers: Arc<DriverRegistry>) -> Self {
        Self {
            drivers,
            object_factories: ObjectFactoryRegistry::new(),
            mail_factory: Box::new(DefaultMailSessionFactory),
            state: Mutex::new(State::Uninitialized),
        }
    }

    /// Replaces the factory used by `bind_mail_session`.
    pub fn with_mail_factory(mut self, factory: impl MailSessionFactory + 'static) -> Self {
        self.mail_factory = Box::new(factory);
        self
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn object_factories(&self) -> &ObjectFactoryRegistry {
        &self.object_factories
    }

    /// Creates the root context and starts the maintenance scheduler.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state()?;
        match *state {
            State::Uninitialized => {}
            State::Running(_) => return Err(JndiError::AlreadyInitialized),
            State::Destroyed => return Err(JndiError::Destroyed),
        }

        let root = NamingContext::new_root(None);
        let scheduler = Scheduler::start(SCHEDULER_THREAD)?;
        *state = State::Running(Running {
            root,
            scheduler,
            tasks: Vec::new(),
        });
        info!("JNDI manager initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.state().is_ok_and(|s| matches!(*s, State::Running(_)))
    }

    /// The root `java:/comp/env` context.
    pub fn root(&self) -> Result<Arc<NamingContext>> {
        let state = self.state()?;
        Ok(Arc::clone(&running(&state)?.root))
    }

    /// Looks up `name` from the root context.
    pub fn lookup(&self, name: &str) -> Result<NamingValue> {
        Ok(self.root()?.lookup(name)?)
    }

    /// Builds a pooled data source and binds it under `jdbc/`.
    ///
    /// A positive `keep_alive_period` schedules a recurring keep-alive probe
    /// and a positive `kill_inactive_period` a recurring drain of idle
    /// connections. Failures propagate to the caller.
    pub fn bind_data_source(&self, config: DataSourceConfig) -> Result<Arc<PooledDataSource>> {
        let mut state = self.state()?;
        let running = running_mut(&mut state)?;

        let path = data_source_path(&config.name);
        let keep_alive = config.keep_alive_period;
        let kill_inactive = config.kill_inactive_period;
        let data_source = Arc::new(PooledDataSource::new(config, &self.drivers)?);

        ensure_parent_contexts(&running.root, &path)?;
        let bound = BoundObject::from_arc(Arc::clone(&data_source));
        if let Err(e) = running.root.bind(&path.to_string(), bound) {
            data_source.close();
            return Err(e.into());
        }

        if !keep_alive.is_zero() {
            let weak = Arc::downgrade(&data_source);
            if let Some(task) = running.scheduler.schedule_at_fixed_rate(
                format!("{path} keep-alive"),
                keep_alive,
                keep_alive,
                move || {
                    if let Some(ds) = weak.upgrade() {
                        ds.keep_alive();
                    }
                    Ok(())
                },
            ) {
                running.tasks.push(task);
            }
        }
        if !kill_inactive.is_zero() {
            let weak = Arc::downgrade(&data_source);
            if let Some(task) = running.scheduler.schedule_at_fixed_rate(
                format!("{path} drain"),
                kill_inactive,
                kill_inactive,
                move || {
                    if let Some(ds) = weak.upgrade() {
                        ds.drain_inactive();
                    }
                    Ok(())
                },
            ) {
                running.tasks.push(task);
            }
        }

        info!(name = %path, "bound data source");
        Ok(data_source)
    }

    /// Builds a mail session from `properties` and binds it under `name`.
    pub fn bind_mail_session(&self, name: &str, properties: &HashMap<String, String>) -> Result<()> {
        let state = self.state()?;
        let running = running(&state)?;

        let session = self
            .mail_factory
            .create(properties)
            .map_err(|e| JndiError::construction(name, e))?;
        ensure_parent_contexts(&running.root, &CompositeName::parse(name))?;
        running.root.bind(name, session)?;
        info!(name, "bound mail session");
        Ok(())
    }

    /// Builds an object of `class_name` from `value` and binds it.
    ///
    /// Failures are logged and reported as `false`; one bad entry never
    /// stops the others from being bound.
    pub fn bind(&self, name: &str, class_name: &str, value: &str) -> bool {
        let result = self.state().and_then(|state| {
            let running = running(&state)?;
            let object = self.object_factories.create(class_name, value)?;
            ensure_parent_contexts(&running.root, &CompositeName::parse(name))?;
            running.root.bind(name, object)?;
            Ok(())
        });

        match result {
            Ok(()) => {
                debug!(name, class_name, "bound environment entry");
                true
            }
            Err(e) => {
                warn!(name, class_name, error = %e, "failed to bind environment entry");
                false
            }
        }
    }

    /// Closes every data source, the root context and the scheduler.
    ///
    /// Pending maintenance tasks are dropped without waiting.
    pub fn destroy(&self) -> Result<()> {
        let running = {
            let mut state = self.state()?;
            match std::mem::replace(&mut *state, State::Destroyed) {
                State::Running(running) => running,
                State::Uninitialized => {
                    *state = State::Uninitialized;
                    return Err(JndiError::NotInitialized);
                }
                State::Destroyed => return Err(JndiError::Destroyed),
            }
        };

        for task in &running.tasks {
            task.cancel();
        }
        let closed = match running.root.lookup(DATA_SOURCE_CONTEXT) {
            Ok(NamingValue::Context(jdbc)) => close_data_sources(&jdbc),
            Ok(_) | Err(NamingError::NameNotFound(_)) => 0,
            Err(e) => {
                warn!(error = %e, "failed to walk data sources");
                0
            }
        };
        running.root.close();
        let dropped = running.scheduler.shutdown_now();
        info!(data_sources = closed, dropped_tasks = dropped, "JNDI manager destroyed");
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| JndiError::LockPoisoned)
    }
}

impl fmt::Debug for JndiManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JndiManager")
            .field("initialized", &self.is_initialized())
            .field("drivers", &self.drivers)
            .finish_non_exhaustive()
    }
}

fn running(state: &State) -> Result<&Running> {
    match state {
        State::Running(running) => Ok(running),
        State::Uninitialized => Err(JndiError::NotInitialized),
        State::Destroyed => Err(JndiError::Destroyed),
    }
}

fn running_mut(state: &mut State) -> Result<&mut Running> {
    match state {
        State::Running(running) => Ok(running),
        State::Uninitialized => Err(JndiError::NotInitialized),
        State::Destroyed => Err(JndiError::Destroyed),
    }
}

/// `main` and `jdbc/main` both bind at `jdbc/main`.
fn data_source_path(name: &str) -> CompositeName {
    let name = CompositeName::parse(name);
    if name.get(0) == Some(DATA_SOURCE_CONTEXT) {
        return name;
    }
    let mut path = CompositeName::parse(DATA_SOURCE_CONTEXT);
    path.extend(&name);
    path
}

/// Creates any missing intermediate contexts of `path`.
fn ensure_parent_contexts(root: &NamingContext, path: &CompositeName) -> Result<()> {
    for depth in 1..path.len() {
        let parent = path.prefix(depth).to_string();
        match root.lookup(&parent) {
            Ok(_) => {}
            Err(NamingError::NameNotFound(_)) => {
                root.create_subcontext(&parent)?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Closes and unbinds every data source in `ctx` and its subcontexts.
fn close_data_sources(ctx: &NamingContext) -> usize {
    let bindings = match ctx.list_bindings("") {
        Ok(bindings) => bindings,
        Err(e) => {
            warn!(error = %e, "failed to list data sources");
            return 0;
        }
    };

    let mut closed = 0;
    for binding in bindings {
        if let Some(child) = binding.value.as_context() {
            closed += close_data_sources(child);
        } else if let Some(ds) = binding.value.downcast_arc::<PooledDataSource>() {
            ds.close();
            if let Err(e) = ctx.unbind(&binding.name) {
                warn!(name = %binding.name, error = %e, "failed to unbind data source");
            }
            closed += 1;
        }
    }
    closed
}
