//! The process-wide server context.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use winstone_config::WinstoneConfig;
use winstone_jndi::JndiManager;

use crate::cluster_registry::ClusterMember;
use crate::host::HostGroup;
use crate::object_pool::ObjectPool;
use crate::signal::StopSignal;

/// Everything the running server shares, created once by the
/// [`Launcher`](crate::Launcher) and handed to each component by `Arc`.
pub struct ServerContext {
    config: WinstoneConfig,
    object_pool: ObjectPool,
    host_group: Arc<HostGroup>,
    jndi: Option<Arc<JndiManager>>,
    cluster: Option<Arc<dyn ClusterMember>>,
    shutdown: StopSignal,
}

impl ServerContext {
    pub(crate) fn new(
        config: WinstoneConfig,
        object_pool: ObjectPool,
        host_group: Arc<HostGroup>,
        jndi: Option<Arc<JndiManager>>,
        cluster: Option<Arc<dyn ClusterMember>>,
    ) -> Self {
        Self {
            config,
            object_pool,
            host_group,
            jndi,
            cluster,
            shutdown: StopSignal::new(),
        }
    }

    pub fn config(&self) -> &WinstoneConfig {
        &self.config
    }

    pub fn object_pool(&self) -> &ObjectPool {
        &self.object_pool
    }

    pub fn host_group(&self) -> &Arc<HostGroup> {
        &self.host_group
    }

    /// The JNDI manager, if `useJNDI` is set.
    pub fn jndi(&self) -> Option<&Arc<JndiManager>> {
        self.jndi.as_ref()
    }

    /// The cluster, if `useCluster` is set.
    pub fn cluster(&self) -> Option<&Arc<dyn ClusterMember>> {
        self.cluster.as_ref()
    }

    /// Asks the launcher to shut down. Returns false if already asked.
    pub fn request_shutdown(&self) -> bool {
        let first = self.shutdown.stop();
        if first {
            info!("shutdown requested");
        }
        first
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_stopped()
    }

    /// Blocks until a shutdown is requested.
    pub fn wait_for_shutdown(&self) {
        self.shutdown.wait();
    }

    /// Waits up to `timeout`. Returns true if a shutdown was requested.
    pub fn wait_for_shutdown_timeout(&self, timeout: Duration) -> bool {
        self.shutdown.wait_timeout(timeout)
    }

    /// Destroys the components in dependency order: handlers first, then
    /// sessions, the cluster and JNDI.
    pub(crate) fn destroy_components(&self) {
        self.object_pool.destroy();
        self.host_group.destroy();
        if let Some(cluster) = &self.cluster {
            cluster.destroy();
        }
        if let Some(jndi) = &self.jndi {
            if let Err(e) = jndi.destroy() {
                warn!(error = %e, "JNDI shutdown failed");
            }
        }
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("host_group", &self.host_group)
            .field("object_pool", &self.object_pool)
            .field("jndi", &self.jndi.is_some())
            .field("cluster", &self.cluster.as_ref().map(|c| c.known_nodes()))
            .field("shutdown_requested", &self.is_shutdown_requested())
            .finish()
    }
}
