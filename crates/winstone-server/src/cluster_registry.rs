//! Cluster implementations selectable by name.

use std::collections::HashMap;
use std::fmt;
use std::net::TcpStream;
use std::sync::Arc;

use winstone_cluster::{ClusterConfig, ClusterError, SessionDirectory, SimpleCluster};
use winstone_session::Cluster;

use crate::error::{ServerError, ServerResult};

/// Name of the built-in [`SimpleCluster`].
pub const SIMPLE_CLUSTER: &str = "simple";

/// What the server needs from a cluster beyond session search.
pub trait ClusterMember: Cluster {
    /// Serves a cluster request arriving on the control port.
    fn cluster_request(
        &self,
        request_type: u8,
        stream: &mut TcpStream,
        directory: &dyn SessionDirectory,
    ) -> Result<(), ClusterError>;

    fn known_nodes(&self) -> Vec<String>;

    fn destroy(&self);
}

impl ClusterMember for SimpleCluster {
    fn cluster_request(
        &self,
        request_type: u8,
        stream: &mut TcpStream,
        directory: &dyn SessionDirectory,
    ) -> Result<(), ClusterError> {
        SimpleCluster::cluster_request(self, request_type, stream, directory)
    }

    fn known_nodes(&self) -> Vec<String> {
        SimpleCluster::known_nodes(self)
    }

    fn destroy(&self) {
        SimpleCluster::destroy(self);
    }
}

pub type ClusterFactory =
    Box<dyn Fn(ClusterConfig) -> Result<Arc<dyn ClusterMember>, ClusterError> + Send + Sync>;

/// Maps `clusterClassName` values to cluster constructors.
pub struct ClusterRegistry {
    factories: HashMap<String, ClusterFactory>,
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterRegistry {
    /// A registry with [`SimpleCluster`] under `"simple"`.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(SIMPLE_CLUSTER, |config| {
            let cluster: Arc<dyn ClusterMember> = SimpleCluster::start(config)?;
            Ok(cluster)
        });
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(ClusterConfig) -> Result<Arc<dyn ClusterMember>, ClusterError> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Starts the cluster registered under `name`.
    pub fn create(&self, name: &str, config: ClusterConfig) -> ServerResult<Arc<dyn ClusterMember>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ServerError::UnknownCluster(name.to_owned()))?;
        Ok(factory(config)?)
    }
}

impl fmt::Debug for ClusterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ClusterRegistry").field("names", &names).finish()
    }
}
