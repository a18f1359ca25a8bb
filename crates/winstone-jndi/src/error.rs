//! JNDI error types.

use thiserror::Error;
use winstone_naming::NamingError;
use winstone_pool::PoolError;

/// Result type for JNDI operations.
pub type Result<T> = std::result::Result<T, JndiError>;

/// Errors that can occur while managing JNDI resources.
#[derive(Debug, Error)]
pub enum JndiError {
    /// The manager has not been initialized yet.
    #[error("JNDI manager not initialized")]
    NotInitialized,

    /// `initialize` was called on a manager that is already running.
    #[error("JNDI manager already initialized")]
    AlreadyInitialized,

    /// The manager has been destroyed.
    #[error("JNDI manager destroyed")]
    Destroyed,

    /// A resource could not be built from its configuration.
    #[error("failed to construct {name}: {reason}")]
    ConstructionFailure { name: String, reason: String },

    /// No connection driver is registered under the name.
    #[error("unknown driver: {0}")]
    UnknownDriver(String),

    /// No object factory is registered for the class name.
    #[error("no object factory for {0}")]
    UnknownClassName(String),

    /// Every connection attempt failed validation.
    #[error("no valid connection from {name} after {attempts} attempts")]
    ConnectionUnavailable { name: String, attempts: usize },

    /// A background thread could not be started.
    #[error("failed to start {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The manager's lock was poisoned by a panicking thread.
    #[error("JNDI manager lock poisoned")]
    LockPoisoned,

    /// Naming error.
    #[error(transparent)]
    Naming(#[from] NamingError),

    /// Pool error.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl JndiError {
    pub(crate) fn construction(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConstructionFailure {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}
