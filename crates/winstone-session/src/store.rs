//! The set of live sessions of one web application.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::codec::{SessionData, is_valid_session_id};
use crate::error::{Result, SessionError};
use crate::listener::{ExecutionContext, SessionListeners};
use crate::session::{Session, now_millis};

/// Directory under the web application's temp dir holding saved sessions.
pub const SESSIONS_DIR: &str = "WEB-INF/winstoneSessions";

/// Extension of saved session files.
pub const SESSION_FILE_EXTENSION: &str = "ser";

/// Asks peer nodes for a session this node does not hold.
pub trait Cluster: Send + Sync {
    /// Searches the cluster for `session_id` in the web application
    /// identified by `context`. A peer handing the session over passivates
    /// its own copy.
    fn find_session(&self, session_id: &str, context: &ExecutionContext) -> Option<SessionData>;
}

/// Settings for a [`SessionStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub host: String,
    /// Context path of the web application, e.g. `/shop` or `` for root.
    pub prefix: String,
    /// Default max inactive interval in seconds.
    pub session_timeout_secs: i32,
    /// Sessions may be moved between cluster nodes.
    pub distributable: bool,
    /// Temp directory of the web application.
    pub temp_dir: PathBuf,
    /// Save sessions on `destroy` instead of invalidating them.
    pub use_saved_sessions: bool,
    pub listeners: SessionListeners,
}

impl StoreConfig {
    pub fn new(host: impl Into<String>, prefix: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            host: host.into(),
            prefix: prefix.into(),
            session_timeout_secs: 1800,
            distributable: false,
            temp_dir: temp_dir.into(),
            use_saved_sessions: false,
            listeners: SessionListeners::default(),
        }
    }
}

/// The live sessions of one web application, keyed by id.
pub struct SessionStore {
    me: Weak<Self>,
    config: StoreConfig,
    context: ExecutionContext,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    cluster: RwLock<Option<Arc<dyn Cluster>>>,
}

impl SessionStore {
    pub fn new(config: StoreConfig) -> Arc<Self> {
        let context = ExecutionContext::new(config.host.clone(), config.prefix.clone());
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            context,
            sessions: Mutex::new(HashMap::new()),
            cluster: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn execution_context(&self) -> ExecutionContext {
        self.context.clone()
    }

    pub fn listeners(&self) -> &SessionListeners {
        &self.config.listeners
    }

    /// Sets the cluster consulted by `find_session`.
    pub fn set_cluster(&self, cluster: Arc<dyn Cluster>) {
        *self.cluster.write().unwrap_or_else(PoisonError::into_inner) = Some(cluster);
    }

    pub(crate) fn weak(&self) -> Weak<Self> {
        self.me.clone()
    }

    /// Directory saved sessions are written to.
    pub fn sessions_dir(&self) -> PathBuf {
        self.config.temp_dir.join(SESSIONS_DIR)
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Creates a session with a fresh id and notifies session listeners.
    pub fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new(
            Uuid::new_v4().simple().to_string().to_uppercase(),
            self.config.session_timeout_secs,
            self.config.distributable,
            self.weak(),
        ));
        self.insert(Arc::clone(&session));

        for listener in self.listeners().session_listeners() {
            listener.session_created(&self.context, &session);
        }
        debug!(session = %session.id(), context = %self.context, "session created");
        session
    }

    /// The locally held session `id`.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions().get(id).cloned()
    }

    /// The session `id`, asking the cluster if it is not held locally and
    /// this store is distributable. A session found remotely is activated
    /// here before it is returned.
    pub fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.session(id) {
            return Some(session);
        }
        if !self.config.distributable {
            return None;
        }

        let cluster = self
            .cluster
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        if !is_valid_session_id(id) {
            return None;
        }
        let data = cluster.find_session(id, &self.context)?;
        if data.id != id {
            warn!(session = %id, returned = %data.id, "cluster returned a different session; dropped");
            return None;
        }
        let session = Arc::new(Session::from_data(data));
        match session.activate(self) {
            Ok(()) => {
                info!(session = %id, context = %self.context, "session migrated from cluster");
                Some(session)
            }
            Err(e) => {
                warn!(session = %id, error = %e, "failed to activate migrated session");
                None
            }
        }
    }

    pub(crate) fn insert(&self, session: Arc<Session>) {
        self.sessions().insert(session.id().to_owned(), session);
    }

    /// Drops session `id` from the store without notifying anyone.
    pub fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions().remove(id)
    }

    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    /// Invalidates every expired session that no request is using.
    /// Returns how many were invalidated.
    pub fn invalidate_expired(&self) -> usize {
        let now = now_millis();
        let mut invalidated = 0;
        for session in self.snapshot() {
            if session.is_in_use() || !session.is_expired_at(now) {
                continue;
            }
            match session.invalidate() {
                Ok(()) => invalidated += 1,
                // Invalidated concurrently.
                Err(SessionError::InvalidState(_)) => {}
                Err(e) => warn!(session = %session.id(), error = %e, "expiry sweep failed"),
            }
        }
        if invalidated > 0 {
            debug!(context = %self.context, invalidated, "expired sessions invalidated");
        }
        invalidated
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Writes every session to `<temp>/WEB-INF/winstoneSessions/<id>.ser`.
    /// Returns how many were written.
    pub fn save_sessions(&self) -> Result<usize> {
        let dir = self.sessions_dir();
        fs::create_dir_all(&dir).map_err(|e| SessionError::io(&dir, e))?;

        let mut saved = 0;
        for session in self.snapshot() {
            let data = match session.to_data() {
                Ok(data) => data,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "failed to snapshot session");
                    continue;
                }
            };
            let path = match session_file(&dir, &data.id) {
                Ok(path) => path,
                Err(e) => {
                    warn!(error = %e, "not saving session");
                    continue;
                }
            };
            fs::write(&path, data.encode()?).map_err(|e| SessionError::io(&path, e))?;
            saved += 1;
        }
        info!(context = %self.context, saved, dir = %dir.display(), "sessions saved");
        Ok(saved)
    }

    /// Loads every saved session, deleting the files as they are read.
    ///
    /// Unreadable files are logged and skipped. A loaded session that has
    /// expired in the meantime is invalidated immediately. Returns how many
    /// sessions remain live.
    pub fn load_sessions(&self) -> Result<usize> {
        let dir = self.sessions_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(SessionError::io(&dir, e)),
        };

        let now = now_millis();
        let mut loaded = 0;
        for entry in entries {
            let path = entry.map_err(|e| SessionError::io(&dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SESSION_FILE_EXTENSION) {
                continue;
            }

            let data = fs::read(&path)
                .map_err(|e| SessionError::io(&path, e))
                .and_then(|bytes| SessionData::decode(&bytes));
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove session file");
            }
            let data = match data {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable session file");
                    continue;
                }
            };

            let session = Arc::new(Session::from_data(data));
            session.activate(self)?;
            if session.is_expired_at(now) {
                session.invalidate()?;
            } else {
                loaded += 1;
            }
        }
        info!(context = %self.context, loaded, "saved sessions loaded");
        Ok(loaded)
    }

    /// Shuts the store down: saves the sessions if configured to, otherwise
    /// invalidates them.
    pub fn destroy(&self) -> Result<()> {
        if self.config.use_saved_sessions {
            self.save_sessions()?;
            self.sessions().clear();
            return Ok(());
        }

        for session in self.snapshot() {
            match session.invalidate() {
                Ok(()) | Err(SessionError::InvalidState(_)) => {}
                Err(e) => warn!(session = %session.id(), error = %e, "failed to invalidate session"),
            }
        }
        Ok(())
    }

    /// Clones the session handles so no session method runs under the map
    /// lock.
    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions().values().cloned().collect()
    }

    // Sessions never call back into the store while it is locked, so the
    // map stays consistent under poisoning.
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("context", &self.context)
            .field("sessions", &self.len())
            .field("distributable", &self.config.distributable)
            .finish_non_exhaustive()
    }
}

/// `<dir>/<id>.ser`. Ids outside the id alphabet are refused so the file
/// cannot land outside `dir`.
fn session_file(dir: &Path, id: &str) -> Result<PathBuf> {
    if !is_valid_session_id(id) {
        return Err(SessionError::Decode(format!("invalid session id {id:?}")));
    }
    Ok(dir.join(format!("{id}.{SESSION_FILE_EXTENSION}")))
}
