//! # winstone-cluster: session hand-off between nodes
//!
//! [`SimpleCluster`] keeps a registry of peer nodes, addressed by their
//! control ports, alive through periodic heartbeats. A node asked for a
//! session it does not hold searches every peer in parallel; the peer that
//! holds it transfers the encoded session and passivates its own copy once
//! the transfer is acknowledged.
//!
//! The server's control port reads the leading type byte of each
//! connection and hands cluster requests to
//! [`SimpleCluster::cluster_request`].

mod cluster;
mod config;
mod error;
pub mod wire;

pub use cluster::{SessionDirectory, SimpleCluster};
pub use config::{ClusterConfig, DEFAULT_HEARTBEAT_PERIOD, parse_node_list};
pub use error::{ClusterError, Result};

#[cfg(test)]
mod tests;
