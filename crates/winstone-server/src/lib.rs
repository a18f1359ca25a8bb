//! # winstone-server: the Winstone container core
//!
//! Wires the other crates into a running server:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Launcher                            │
//! │  ┌───────────┐   ┌────────────┐   ┌────────────────────────┐ │
//! │  │ Listeners │ → │ ObjectPool │ → │ Listener::serve        │ │
//! │  │ (accept)  │   │ (handlers) │   │ (Request / Response)   │ │
//! │  └───────────┘   └────────────┘   └────────────────────────┘ │
//! │  ┌─────────────┐   ┌───────────┐   ┌───────────────────────┐ │
//! │  │ ControlPort │ → │ HostGroup │ → │ SessionStore per app  │ │
//! │  │ (0 / 4 / *) │   │ (reload)  │   │                       │ │
//! │  └─────────────┘   └───────────┘   └───────────────────────┘ │
//! │         └──────→ ClusterMember (session search, heartbeats)  │
//! │  JndiManager (data sources, mail sessions, env entries)      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Threads are plain OS threads throughout; there is no async runtime.
//!
//! ## Usage
//!
//! ```ignore
//! use winstone_config::WinstoneConfig;
//! use winstone_server::Launcher;
//!
//! let config = WinstoneConfig::load()?;
//! let launcher = Launcher::builder(config)
//!     .with_listener("0.0.0.0:8080", http_listener)
//!     .start()?;
//! launcher.wait_for_shutdown();
//! launcher.shutdown();
//! ```

mod acceptor;
mod cluster_registry;
mod context;
pub mod control;
mod error;
mod host;
mod launcher;
mod listener;
mod object_pool;
mod request;
mod signal;

pub use cluster_registry::{ClusterFactory, ClusterMember, ClusterRegistry, SIMPLE_CLUSTER};
pub use context::ServerContext;
pub use control::{ControlPort, send_reload, send_shutdown};
pub use error::{ServerError, ServerResult};
pub use host::{Host, HostGroup, HostOptions, WebApp};
pub use launcher::{Launcher, LauncherBuilder};
pub use listener::{KeepAlive, Listener};
pub use object_pool::{ObjectPool, ObjectPoolConfig, ObjectPoolStats};
pub use request::{Request, Response, UNIQUE_ID_ATTRIBUTE};
