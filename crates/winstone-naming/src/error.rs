//! Naming error types.

use thiserror::Error;

/// Result type for naming operations.
pub type Result<T> = std::result::Result<T, NamingError>;

/// Errors raised while resolving or mutating a naming tree.
///
/// Every variant carries the name (or segment) that failed so callers can
/// report precisely where resolution stopped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NamingError {
    /// Nothing is bound under the name.
    #[error("name not found: {0}")]
    NameNotFound(String),

    /// The leaf segment is already occupied.
    #[error("name already bound: {0}")]
    NameAlreadyBound(String),

    /// An intermediate segment resolved to something that is not a context.
    #[error("not a context: {0}")]
    NotAContext(String),

    /// The name is not valid for the requested operation.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The operation is not supported for these names.
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// Link resolution exceeded the hop limit.
    #[error("link loop detected while resolving {0}")]
    LinkLoop(String),

    /// The context instance has been closed.
    #[error("context closed: {0}")]
    Closed(String),

    /// A context lock was poisoned by a panicking thread.
    #[error("naming context lock poisoned")]
    LockPoisoned,
}
