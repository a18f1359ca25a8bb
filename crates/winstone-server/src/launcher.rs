//! Server startup and shutdown.
//!
//! Components start in dependency order and stop in reverse:
//!
//! 1. JNDI, with the configured data sources, mail sessions and env entries
//! 2. the cluster, which needs the control port number to advertise
//! 3. hosts and their web applications, which need the cluster
//! 4. the object pool
//! 5. the control port
//! 6. connection listeners
//!
//! If any step fails, whatever already started is torn down before the
//! error is returned.

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};
use winstone_cluster::ClusterConfig;
use winstone_config::{ConfigError, DataSourceSettings, WinstoneConfig};
use winstone_jndi::{DataSourceConfig, JndiManager};
use winstone_session::{Cluster, SessionListeners};

use crate::acceptor::AcceptLoop;
use crate::cluster_registry::{ClusterMember, ClusterRegistry};
use crate::context::ServerContext;
use crate::control::ControlPort;
use crate::error::{ServerError, ServerResult};
use crate::host::HostGroup;
use crate::listener::Listener;
use crate::object_pool::{ObjectPool, ObjectPoolConfig};

/// Configures a [`Launcher`] before starting it.
pub struct LauncherBuilder {
    config: WinstoneConfig,
    listeners: Vec<(String, Arc<dyn Listener>)>,
    jndi: Option<JndiManager>,
    clusters: ClusterRegistry,
    session_listeners: HashMap<String, SessionListeners>,
}

impl LauncherBuilder {
    /// Accepts connections on `addr` and serves them with `listener`.
    pub fn with_listener(mut self, addr: impl Into<String>, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push((addr.into(), listener));
        self
    }

    /// Uses `jndi` instead of a default manager when `useJNDI` is set.
    /// Drivers and mail factories are registered on it beforehand.
    pub fn with_jndi(mut self, jndi: JndiManager) -> Self {
        self.jndi = Some(jndi);
        self
    }

    pub fn with_cluster_registry(mut self, clusters: ClusterRegistry) -> Self {
        self.clusters = clusters;
        self
    }

    /// Listeners for the web application at `prefix`.
    pub fn with_session_listeners(mut self, prefix: impl Into<String>, listeners: SessionListeners) -> Self {
        self.session_listeners.insert(prefix.into(), listeners);
        self
    }

    pub fn start(self) -> ServerResult<Launcher> {
        let Self {
            config,
            listeners,
            jndi,
            clusters,
            session_listeners,
        } = self;
        config.validate()?;

        let mut started = Teardown::new();

        if config.use_jndi {
            let jndi = Arc::new(jndi.unwrap_or_default());
            jndi.initialize()?;
            started.jndi = Some(Arc::clone(&jndi));
            bind_resources(&jndi, &config);
        }

        if config.use_cluster {
            let port = config.control_port().ok_or_else(|| {
                ConfigError::ValidationError("useCluster requires a controlPort".into())
            })?;
            let cluster_config = ClusterConfig::new(config.control_address.clone(), port)
                .with_nodes(&config.cluster_nodes)
                .with_heartbeat_period(config.heartbeat_period());
            started.cluster = Some(clusters.create(&config.cluster_class_name, cluster_config)?);
        }

        let session_cluster = started
            .cluster
            .as_ref()
            .map(|cluster| Arc::clone(cluster) as Arc<dyn Cluster>);
        let host_group = HostGroup::start(&config, session_cluster, &session_listeners)?;
        started.host_group = Some(Arc::clone(&host_group));

        let object_pool = ObjectPool::new(ObjectPoolConfig::from_config(&config))?;

        let (started_jndi, started_cluster) = started.disarm();
        let control_port = config.control_port();
        let control_address = config.control_address.clone();
        let context = Arc::new(ServerContext::new(
            config,
            object_pool,
            host_group,
            started_jndi,
            started_cluster,
        ));

        let mut launcher = Launcher {
            context: Arc::clone(&context),
            control: Mutex::new(None),
            acceptors: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        };

        // From here on, dropping `launcher` shuts everything down.
        if let Some(port) = control_port {
            let control = ControlPort::start(&control_address, port, Arc::clone(&context))?;
            *launcher.control.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(control);
        }

        for (addr, listener) in listeners {
            let socket = TcpListener::bind(&addr).map_err(|source| ServerError::BindFailed {
                addr: addr.clone(),
                source,
            })?;
            let name = listener.name().to_owned();
            let context = Arc::clone(&context);
            let acceptor = AcceptLoop::spawn(&name, socket, move |stream| {
                context.object_pool().handle_request(stream, Arc::clone(&listener));
            })?;
            info!(listener = %name, addr = %acceptor.local_addr(), "listener started");
            launcher
                .acceptors
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner)
                .push(acceptor);
        }

        info!(
            host = %context.config().hostname,
            jndi = context.jndi().is_some(),
            cluster = context.cluster().is_some(),
            "server started"
        );
        Ok(launcher)
    }
}

impl std::fmt::Debug for LauncherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LauncherBuilder")
            .field("listeners", &self.listeners.iter().map(|(addr, _)| addr).collect::<Vec<_>>())
            .field("clusters", &self.clusters)
            .finish_non_exhaustive()
    }
}

/// A running server.
pub struct Launcher {
    context: Arc<ServerContext>,
    control: Mutex<Option<ControlPort>>,
    acceptors: Mutex<Vec<AcceptLoop>>,
    stopped: AtomicBool,
}

impl Launcher {
    pub fn builder(config: WinstoneConfig) -> LauncherBuilder {
        LauncherBuilder {
            config,
            listeners: Vec::new(),
            jndi: None,
            clusters: ClusterRegistry::new(),
            session_listeners: HashMap::new(),
        }
    }

    /// Starts a server with no connection listeners.
    pub fn start(config: WinstoneConfig) -> ServerResult<Self> {
        Self::builder(config).start()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.control
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(ControlPort::local_addr)
    }

    /// Addresses of the connection listeners, in registration order.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.acceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(AcceptLoop::local_addr)
            .collect()
    }

    /// Blocks until a shutdown is requested through the control port or
    /// [`ServerContext::request_shutdown`].
    pub fn wait_for_shutdown(&self) {
        self.context.wait_for_shutdown();
    }

    /// Stops everything. Only the first call does any work.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.context.request_shutdown();

        let acceptors = std::mem::take(&mut *self.acceptors.lock().unwrap_or_else(PoisonError::into_inner));
        for mut acceptor in acceptors {
            acceptor.stop();
        }
        if let Some(mut control) = self.control.lock().unwrap_or_else(PoisonError::into_inner).take() {
            control.stop();
        }
        self.context.destroy_components();
        info!("server stopped");
    }
}

impl Drop for Launcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("context", &self.context)
            .field("control_addr", &self.control_addr())
            .field("listener_addrs", &self.listener_addrs())
            .finish()
    }
}

/// Components started so far, destroyed on drop unless disarmed.
struct Teardown {
    jndi: Option<Arc<JndiManager>>,
    cluster: Option<Arc<dyn ClusterMember>>,
    host_group: Option<Arc<HostGroup>>,
    armed: bool,
}

impl Teardown {
    fn new() -> Self {
        Self {
            jndi: None,
            cluster: None,
            host_group: None,
            armed: true,
        }
    }

    /// Hands over the JNDI manager and the cluster.
    fn disarm(mut self) -> (Option<Arc<JndiManager>>, Option<Arc<dyn ClusterMember>>) {
        self.armed = false;
        (self.jndi.take(), self.cluster.take())
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(host_group) = &self.host_group {
            host_group.destroy();
        }
        if let Some(cluster) = &self.cluster {
            cluster.destroy();
        }
        if let Some(jndi) = &self.jndi {
            if let Err(e) = jndi.destroy() {
                warn!(error = %e, "JNDI shutdown failed");
            }
        }
        warn!("server startup aborted");
    }
}

/// Binds the configured resources. A resource that fails to bind is
/// logged and skipped.
fn bind_resources(jndi: &JndiManager, config: &WinstoneConfig) {
    for settings in &config.data_sources {
        if let Err(e) = jndi.bind_data_source(data_source_config(settings)) {
            warn!(name = %settings.name, error = %e, "failed to bind data source");
        }
    }
    for mail in &config.mail_sessions {
        let properties: HashMap<_, _> = mail
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Err(e) = jndi.bind_mail_session(&mail.name, &properties) {
            warn!(name = %mail.name, error = %e, "failed to bind mail session");
        }
    }
    // `bind` logs its own failures.
    let bound = config
        .env_entries
        .iter()
        .filter(|entry| jndi.bind(&entry.name, &entry.class_name, &entry.value))
        .count();
    if !config.env_entries.is_empty() {
        info!(bound, configured = config.env_entries.len(), "env entries bound");
    }
}

fn data_source_config(settings: &DataSourceSettings) -> DataSourceConfig {
    let mut config = DataSourceConfig::new(&settings.name, &settings.driver, &settings.url);
    config.username.clone_from(&settings.username);
    config.password.clone_from(&settings.password);
    config.properties = settings
        .properties
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    config.max_connections = settings.max_connections as usize;
    config.max_idle = settings.max_idle as usize;
    config.starting_connections = settings.starting_connections as usize;
    config.max_wait = Duration::from_millis(settings.max_wait_ms);
    config.validation_query.clone_from(&settings.validation_query);
    config.validation_timeout = Duration::from_millis(settings.validation_timeout_ms);
    config.keep_alive_query.clone_from(&settings.keep_alive_query);
    config.keep_alive_period = Duration::from_millis(settings.keep_alive_period_ms);
    config.kill_inactive_period = Duration::from_millis(settings.kill_inactive_period_ms);
    config
}
