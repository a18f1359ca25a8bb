//! Error types for cluster operations.

use thiserror::Error;
use winstone_session::SessionError;

/// Cluster errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// A peer could not be reached. Never fatal; the peer is treated as
    /// absent.
    #[error("peer {peer} unreachable: {source}")]
    PeerUnreachable {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// A peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The leading type byte names no cluster request.
    #[error("unknown cluster request type {0:#04x}")]
    UnknownRequestType(u8),

    /// A transferred session could not be encoded or decoded.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;
