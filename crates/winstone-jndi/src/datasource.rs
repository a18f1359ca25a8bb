//! Pooled database connections.
//!
//! Drivers are registered by name in a [`DriverRegistry`] and produce
//! [`DbConnection`]s. A [`PooledDataSource`] keeps those connections in a
//! [`ResourcePool`] and validates each one on checkout, on a helper thread
//! so a hung connection cannot stall the caller past `validation_timeout`.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};
use winstone_pool::{BoxError, PoolConfig, PoolStats, ResourceFactory, ResourcePool};

use crate::error::{JndiError, Result};

/// An open database connection.
pub trait DbConnection: Send {
    /// Executes a statement, discarding any result rows.
    fn execute(&mut self, sql: &str) -> std::result::Result<(), BoxError>;

    /// Returns true if the connection is usable.
    fn is_valid(&mut self, timeout: Duration) -> bool;

    /// Releases the underlying handles.
    fn close(&mut self) {}
}

/// Opens connections for a URL scheme.
pub trait Driver: Send + Sync {
    fn connect(
        &self,
        url: &str,
        properties: &HashMap<String, String>,
    ) -> std::result::Result<Box<dyn DbConnection>, BoxError>;
}

/// Connection drivers keyed by name.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: RwLock<HashMap<String, Arc<dyn Driver>>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` under `name`, replacing any previous driver.
    pub fn register(&self, name: impl Into<String>, driver: impl Driver + 'static) {
        let name = name.into();
        debug!(driver = %name, "registered connection driver");
        self.drivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(driver));
    }

    /// Looks up the driver registered under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| JndiError::UnknownDriver(name.to_owned()))
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let drivers = self.drivers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("DriverRegistry")
            .field("drivers", &drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Settings for one pooled data source.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSourceConfig {
    /// JNDI name, relative to `java:/comp/env`.
    pub name: String,
    /// Name the driver is registered under.
    pub driver: String,
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Extra driver properties.
    pub properties: HashMap<String, String>,
    pub max_connections: usize,
    pub max_idle: usize,
    /// Connections opened eagerly when the data source is built.
    pub starting_connections: usize,
    pub max_wait: Duration,
    /// Query used to validate a connection on checkout.
    pub validation_query: Option<String>,
    pub validation_timeout: Duration,
    /// Query run over idle connections by `keep_alive`. Falls back to the
    /// validation query.
    pub keep_alive_query: Option<String>,
    /// Period of the keep-alive probe. Zero disables it.
    pub keep_alive_period: Duration,
    /// Period of the inactive-connection drain. Zero disables it.
    pub kill_inactive_period: Duration,
}

impl DataSourceConfig {
    pub fn new(name: impl Into<String>, driver: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            url: url.into(),
            username: None,
            password: None,
            properties: HashMap::new(),
            max_connections: 20,
            max_idle: 10,
            starting_connections: 1,
            max_wait: Duration::from_secs(10),
            validation_query: None,
            validation_timeout: Duration::from_secs(3),
            keep_alive_query: None,
            keep_alive_period: Duration::ZERO,
            kill_inactive_period: Duration::ZERO,
        }
    }

    fn connect_properties(&self) -> HashMap<String, String> {
        let mut properties = self.properties.clone();
        if let Some(user) = &self.username {
            properties.insert("user".to_owned(), user.clone());
        }
        if let Some(password) = &self.password {
            properties.insert("password".to_owned(), password.clone());
        }
        properties
    }
}

type Connection = Box<dyn DbConnection>;

struct ConnectionFactory {
    driver: Arc<dyn Driver>,
    url: String,
    properties: HashMap<String, String>,
}

impl ResourceFactory<Connection> for ConnectionFactory {
    fn create(&self) -> std::result::Result<Connection, BoxError> {
        self.driver.connect(&self.url, &self.properties)
    }

    fn destroy(&self, mut resource: Connection) {
        resource.close();
    }
}

/// A named pool of validated database connections.
pub struct PooledDataSource {
    config: DataSourceConfig,
    pool: Arc<ResourcePool<Connection>>,
}

impl PooledDataSource {
    /// Builds the pool and opens `starting_connections` connections.
    pub fn new(config: DataSourceConfig, drivers: &DriverRegistry) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(JndiError::construction(
                &config.name,
                "max_connections must be positive",
            ));
        }

        let factory = ConnectionFactory {
            driver: drivers.get(&config.driver)?,
            url: config.url.clone(),
            properties: config.connect_properties(),
        };
        let pool_config = PoolConfig::new(config.max_connections)
            .with_max_idle(config.max_idle)
            .with_min_idle(config.starting_connections)
            .with_max_wait(config.max_wait);
        let pool = Arc::new(ResourcePool::new(pool_config, factory));

        let mut opened = Vec::with_capacity(config.starting_connections);
        for _ in 0..config.starting_connections.min(config.max_connections) {
            match pool.acquire() {
                Ok(conn) => opened.push(conn),
                Err(e) => {
                    for conn in opened {
                        pool.release(conn);
                    }
                    pool.close();
                    return Err(JndiError::construction(&config.name, e));
                }
            }
        }
        for conn in opened {
            pool.release(conn);
        }

        info!(
            name = %config.name,
            url = %config.url,
            max_connections = config.max_connections,
            "data source ready"
        );
        Ok(Self { config, pool })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &DataSourceConfig {
        &self.config
    }

    /// Checks out a connection that passed validation.
    ///
    /// Connections failing validation are destroyed and another is tried,
    /// at most `max_connections` times in total.
    pub fn get_connection(&self) -> Result<PooledConnection> {
        let attempts = self.config.max_connections;
        for attempt in 1..=attempts {
            let conn = self.pool.acquire()?;
            if let Some(conn) = self.validate(conn) {
                return Ok(PooledConnection {
                    pool: Arc::clone(&self.pool),
                    conn: Some(conn),
                });
            }
            debug!(name = %self.config.name, attempt, "discarded invalid connection");
        }
        warn!(name = %self.config.name, attempts, "no valid connection available");
        Err(JndiError::ConnectionUnavailable {
            name: self.config.name.clone(),
            attempts,
        })
    }

    /// Validates `conn` within `validation_timeout`.
    ///
    /// Returns the connection if it is usable. Otherwise it is invalidated,
    /// by the helper thread itself if the wait timed out.
    fn validate(&self, conn: Connection) -> Option<Connection> {
        let (tx, rx) = mpsc::channel();
        let slot = Arc::new(Mutex::new(Some(conn)));
        let pool = Arc::clone(&self.pool);
        let query = self.config.validation_query.clone();
        let timeout = self.config.validation_timeout;

        let taken = Arc::clone(&slot);
        let spawned = thread::Builder::new()
            .name(format!("{}-validate", self.config.name))
            .spawn(move || {
                let Some(mut conn) = take(&taken) else {
                    return;
                };
                let valid = match &query {
                    Some(sql) => conn.execute(sql).is_ok(),
                    None => conn.is_valid(timeout),
                };
                if let Err(mpsc::SendError((conn, _))) = tx.send((conn, valid)) {
                    pool.invalidate(conn);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn validation thread");
            if let Some(conn) = take(&slot) {
                self.pool.invalidate(conn);
            }
            return None;
        }

        match rx.recv_timeout(timeout) {
            Ok((conn, true)) => Some(conn),
            Ok((conn, false)) => {
                self.pool.invalidate(conn);
                None
            }
            Err(_) => {
                debug!(name = %self.config.name, ?timeout, "connection validation timed out");
                None
            }
        }
    }

    /// Runs the keep-alive query over every idle connection, destroying the
    /// ones that fail. Returns how many were probed.
    pub fn keep_alive(&self) -> usize {
        let query = self
            .config
            .keep_alive_query
            .as_deref()
            .or(self.config.validation_query.as_deref());
        let timeout = self.config.validation_timeout;
        self.pool.apply_on_idle(|conn| match query {
            Some(sql) => conn.execute(sql).is_ok(),
            None => conn.is_valid(timeout),
        })
    }

    /// Closes idle connections beyond `starting_connections`.
    pub fn drain_inactive(&self) -> usize {
        let drained = self.pool.drain();
        if drained > 0 {
            debug!(name = %self.config.name, drained, "closed inactive connections");
        }
        drained
    }

    /// Closes idle connections now and the rest as they are returned.
    pub fn close(&self) {
        self.pool.close();
        info!(name = %self.config.name, "data source closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

impl fmt::Debug for PooledDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledDataSource")
            .field("name", &self.config.name)
            .field("url", &self.config.url)
            .field("stats", &self.pool.stats())
            .finish()
    }
}

fn take(slot: &Mutex<Option<Connection>>) -> Option<Connection> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// A connection on loan from a [`PooledDataSource`], returned on drop.
pub struct PooledConnection {
    pool: Arc<ResourcePool<Connection>>,
    conn: Option<Connection>,
}

impl PooledConnection {
    /// Closes the connection instead of returning it to the pool.
    pub fn invalidate(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.invalidate(conn);
        }
    }
}

impl Deref for PooledConnection {
    type Target = dyn DbConnection;

    fn deref(&self) -> &Self::Target {
        // Only `invalidate` and `drop` take the connection, and both consume
        // the guard.
        self.conn.as_deref().expect("connection already returned")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection already returned")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection").finish_non_exhaustive()
    }
}
