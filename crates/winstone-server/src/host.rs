//! Virtual hosts and their web applications.
//!
//! A [`HostGroup`] owns the hosts, a [`Host`] owns its web applications and
//! the thread that expires their sessions, and a [`WebApp`] owns the
//! session store of one context path.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};
use winstone_cluster::SessionDirectory;
use winstone_config::{WebAppSettings, WinstoneConfig};
use winstone_session::{Cluster, SessionListeners, SessionStore, StoreConfig};

use crate::error::{ServerError, ServerResult};
use crate::signal::StopSignal;

/// Settings shared by every web application of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostOptions {
    pub temp_dir: PathBuf,
    pub session_timeout_secs: i32,
    pub use_saved_sessions: bool,
    pub session_sweep_period: Duration,
}

impl HostOptions {
    pub fn from_config(config: &WinstoneConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            session_timeout_secs: config.session_timeout_secs,
            use_saved_sessions: config.use_saved_sessions,
            session_sweep_period: config.session_sweep_period(),
        }
    }
}

/// One deployed web application.
#[derive(Debug)]
pub struct WebApp {
    host: String,
    settings: WebAppSettings,
    temp_dir: PathBuf,
    store: Arc<SessionStore>,
}

impl WebApp {
    fn start(
        host: &str,
        settings: WebAppSettings,
        options: &HostOptions,
        listeners: SessionListeners,
        cluster: Option<&Arc<dyn Cluster>>,
    ) -> Arc<Self> {
        let temp_dir = webapp_temp_dir(&options.temp_dir, host, &settings.prefix);
        let mut store_config = StoreConfig::new(host, settings.prefix.clone(), temp_dir.clone());
        store_config.session_timeout_secs = options.session_timeout_secs;
        store_config.distributable = settings.distributable;
        store_config.use_saved_sessions = options.use_saved_sessions;
        store_config.listeners = listeners;

        let store = SessionStore::new(store_config);
        if settings.distributable {
            if let Some(cluster) = cluster {
                store.set_cluster(Arc::clone(cluster));
            }
        }
        if options.use_saved_sessions {
            match store.load_sessions() {
                Ok(loaded) => debug!(host, prefix = %settings.prefix, loaded, "saved sessions restored"),
                Err(e) => warn!(host, prefix = %settings.prefix, error = %e, "failed to restore saved sessions"),
            }
        }

        info!(host, prefix = %settings.prefix, distributable = settings.distributable, "web application started");
        Arc::new(Self {
            host: host.to_owned(),
            settings,
            temp_dir,
            store,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.settings.prefix
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_distributable(&self) -> bool {
        self.settings.distributable
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Saves or invalidates the sessions, depending on `useSavedSessions`.
    pub fn destroy(&self) -> ServerResult<()> {
        self.store.destroy()?;
        info!(host = %self.host, prefix = %self.settings.prefix, "web application stopped");
        Ok(())
    }
}

/// A virtual host.
pub struct Host {
    name: String,
    options: HostOptions,
    cluster: Option<Arc<dyn Cluster>>,
    webapps: RwLock<BTreeMap<String, Arc<WebApp>>>,
    stop: Arc<StopSignal>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Host {
    /// Starts the host's web applications and its session sweep.
    pub fn start(
        name: impl Into<String>,
        webapps: &[WebAppSettings],
        options: HostOptions,
        cluster: Option<Arc<dyn Cluster>>,
        listeners: &HashMap<String, SessionListeners>,
    ) -> ServerResult<Arc<Self>> {
        let name = name.into();
        let mut deployed = BTreeMap::new();
        for settings in webapps {
            let webapp = WebApp::start(
                &name,
                settings.clone(),
                &options,
                listeners.get(&settings.prefix).cloned().unwrap_or_default(),
                cluster.as_ref(),
            );
            deployed.insert(settings.prefix.clone(), webapp);
        }

        let host = Arc::new(Self {
            name,
            options,
            cluster,
            webapps: RwLock::new(deployed),
            stop: Arc::new(StopSignal::new()),
            sweeper: Mutex::new(None),
        });

        let weak = Arc::downgrade(&host);
        let stop = Arc::clone(&host.stop);
        let period = host.options.session_sweep_period;
        let sweeper = thread::Builder::new()
            .name(format!("winstone-sessions-{}", host.name))
            .spawn(move || sweep_loop(&weak, &stop, period))?;
        *host.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(sweeper);
        Ok(host)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn webapp(&self, prefix: &str) -> Option<Arc<WebApp>> {
        self.webapps().get(prefix).cloned()
    }

    /// The web application whose prefix is the longest match for `uri`.
    pub fn webapp_for_uri(&self, uri: &str) -> Option<Arc<WebApp>> {
        let path = uri.split(['?', '#']).next().unwrap_or(uri);
        self.webapps()
            .iter()
            .filter(|(prefix, _)| {
                prefix.is_empty()
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, webapp)| Arc::clone(webapp))
    }

    pub fn prefixes(&self) -> Vec<String> {
        self.webapps().keys().cloned().collect()
    }

    /// Stops the web application at `prefix` and starts it again with the
    /// same settings and listeners. Saved sessions survive the reload when
    /// `useSavedSessions` is set.
    pub fn reload_webapp(&self, prefix: &str) -> ServerResult<()> {
        let mut webapps = self.webapps.write().unwrap_or_else(PoisonError::into_inner);
        let old = webapps
            .get(prefix)
            .cloned()
            .ok_or_else(|| ServerError::UnknownWebApp {
                host: self.name.clone(),
                prefix: prefix.to_owned(),
            })?;

        old.destroy()?;
        let reloaded = WebApp::start(
            &self.name,
            old.settings.clone(),
            &self.options,
            old.store.listeners().clone(),
            self.cluster.as_ref(),
        );
        webapps.insert(prefix.to_owned(), reloaded);
        info!(host = %self.name, prefix, "web application reloaded");
        Ok(())
    }

    /// Invalidates expired sessions in every web application. Returns how
    /// many were invalidated.
    pub fn sweep_sessions(&self) -> usize {
        let webapps: Vec<_> = self.webapps().values().cloned().collect();
        webapps
            .iter()
            .map(|webapp| webapp.sessions().invalidate_expired())
            .sum()
    }

    /// Stops the sweep and every web application.
    pub fn destroy(&self) {
        if !self.stop.stop() {
            return;
        }
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            if sweeper.join().is_err() {
                warn!(host = %self.name, "session sweep thread panicked");
            }
        }

        let webapps = std::mem::take(&mut *self.webapps.write().unwrap_or_else(PoisonError::into_inner));
        for webapp in webapps.values() {
            if let Err(e) = webapp.destroy() {
                warn!(host = %self.name, prefix = %webapp.prefix(), error = %e, "failed to stop web application");
            }
        }
        info!(host = %self.name, "host stopped");
    }

    // The map is only replaced wholesale or by single inserts.
    fn webapps(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<WebApp>>> {
        self.webapps.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // The sweep thread may hold the last reference, so it is not
        // joined here.
        self.stop.stop();
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("webapps", &self.prefixes())
            .finish_non_exhaustive()
    }
}

fn sweep_loop(host: &Weak<Host>, stop: &StopSignal, period: Duration) {
    while !stop.wait_timeout(period) {
        let Some(host) = host.upgrade() else {
            return;
        };
        let invalidated = host.sweep_sessions();
        if invalidated > 0 {
            debug!(host = %host.name, invalidated, "session sweep finished");
        }
    }
}

/// `<temp>/<host>/<webapp>`, with `ROOT` for the root application.
fn webapp_temp_dir(temp_dir: &Path, host: &str, prefix: &str) -> PathBuf {
    let name = prefix.trim_start_matches('/').replace('/', "_");
    let name = if name.is_empty() { "ROOT".to_owned() } else { name };
    temp_dir.join(host).join(name)
}

/// Every host of the server.
pub struct HostGroup {
    default_host: String,
    hosts: HashMap<String, Arc<Host>>,
}

impl HostGroup {
    /// Starts the configured host. With no `[[webapps]]` configured a root
    /// web application is deployed.
    pub fn start(
        config: &WinstoneConfig,
        cluster: Option<Arc<dyn Cluster>>,
        listeners: &HashMap<String, SessionListeners>,
    ) -> ServerResult<Arc<Self>> {
        let webapps = if config.webapps.is_empty() {
            vec![WebAppSettings::default()]
        } else {
            config.webapps.clone()
        };
        let host = Host::start(
            config.hostname.clone(),
            &webapps,
            HostOptions::from_config(config),
            cluster,
            listeners,
        )?;
        Ok(Self::from_hosts(config.hostname.clone(), vec![host]))
    }

    /// Groups already started hosts.
    pub fn from_hosts(default_host: impl Into<String>, hosts: Vec<Arc<Host>>) -> Arc<Self> {
        Arc::new(Self {
            default_host: default_host.into(),
            hosts: hosts
                .into_iter()
                .map(|host| (host.name().to_owned(), host))
                .collect(),
        })
    }

    pub fn default_host(&self) -> Option<Arc<Host>> {
        self.host(&self.default_host)
    }

    pub fn host(&self, name: &str) -> Option<Arc<Host>> {
        self.hosts.get(name).cloned()
    }

    /// The host named `name`, falling back to the default host.
    pub fn host_or_default(&self, name: Option<&str>) -> Option<Arc<Host>> {
        name.and_then(|name| self.host(name))
            .or_else(|| self.default_host())
    }

    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn reload_webapp(&self, host: &str, prefix: &str) -> ServerResult<()> {
        self.host(host)
            .ok_or_else(|| ServerError::UnknownHost(host.to_owned()))?
            .reload_webapp(prefix)
    }

    pub fn destroy(&self) {
        for host in self.hosts.values() {
            host.destroy();
        }
    }
}

impl SessionDirectory for HostGroup {
    fn store(&self, host: &str, prefix: &str) -> Option<Arc<SessionStore>> {
        self.host(host)?
            .webapp(prefix)
            .map(|webapp| Arc::clone(webapp.sessions()))
    }
}

impl std::fmt::Debug for HostGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostGroup")
            .field("default_host", &self.default_host)
            .field("hosts", &self.host_names())
            .finish()
    }
}
