//! Server error types.

use thiserror::Error;
use winstone_cluster::ClusterError;
use winstone_config::ConfigError;
use winstone_jndi::JndiError;
use winstone_session::SessionError;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur during server operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A handler, request or response pool is at its ceiling.
    #[error("{pool} pool exhausted (capacity {capacity})")]
    PoolExhausted { pool: &'static str, capacity: usize },

    /// No cluster implementation is registered under this name.
    #[error("unknown cluster implementation: {0}")]
    UnknownCluster(String),

    #[error("unknown host: {0}")]
    UnknownHost(String),

    #[error("no web application at {prefix:?} on host {host}")]
    UnknownWebApp { host: String, prefix: String },

    /// Bind failed.
    #[error("failed to bind to {addr}: {source}")]
    BindFailed {
        addr: String,
        source: std::io::Error,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JNDI error: {0}")]
    Jndi(#[from] JndiError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Server shutdown.
    #[error("server shutdown")]
    Shutdown,
}

impl ServerError {
    /// Returns true if this is a `PoolExhausted` error.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
