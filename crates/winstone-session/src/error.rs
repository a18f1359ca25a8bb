//! Session error types.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by sessions and session stores.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has been invalidated or passivated.
    #[error("session {0} is no longer valid")]
    InvalidState(String),

    /// Encoded session data is malformed.
    #[error("malformed session data: {0}")]
    Decode(String),

    /// Encoded session data has a format version this build cannot read.
    #[error("unsupported session format version {0}")]
    UnsupportedVersion(u8),

    /// Reading or writing a persisted session failed.
    #[error("session file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session lock was poisoned by a panicking thread.
    #[error("session lock poisoned")]
    LockPoisoned,
}

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
