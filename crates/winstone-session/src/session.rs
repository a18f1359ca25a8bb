//! The session entity.
//!
//! # State machine
//!
//! ```text
//! New --touch--> Active --+--invalidate--> Invalidated
//!  |                      |
//!  +----------------------+--passivate---> Passivated
//! ```
//!
//! `Invalidated` and `Passivated` are terminal for an in-memory instance.
//! A passivated session lives on as a fresh instance on another node.
//!
//! All state sits behind one mutex per session. Listener and binding
//! callbacks always run after that mutex is released.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::codec::SessionData;
use crate::error::{Result, SessionError};
use crate::listener::{ExecutionContext, SessionBindingEvent, SessionListeners};
use crate::store::SessionStore;
use crate::value::AttributeValue;

/// Lifecycle state of an in-memory session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet joined by the client.
    New,
    Active,
    Invalidated,
    /// Handed off to another node.
    Passivated,
}

impl SessionState {
    fn is_valid(self) -> bool {
        matches!(self, Self::New | Self::Active)
    }
}

struct Inner {
    state: SessionState,
    /// Set while `invalidate` runs. Rejects new attributes and a second
    /// `invalidate`.
    invalidating: bool,
    last_accessed: i64,
    max_inactive_secs: i32,
    distributable: bool,
    attributes: HashMap<String, AttributeValue>,
    requests: HashSet<u64>,
    store: Weak<SessionStore>,
}

/// An HTTP session.
pub struct Session {
    id: String,
    created: i64,
    inner: Mutex<Inner>,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

impl Session {
    pub(crate) fn new(
        id: String,
        max_inactive_secs: i32,
        distributable: bool,
        store: Weak<SessionStore>,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            created: now,
            inner: Mutex::new(Inner {
                state: SessionState::New,
                invalidating: false,
                last_accessed: now,
                max_inactive_secs,
                distributable,
                attributes: HashMap::new(),
                requests: HashSet::new(),
                store,
            }),
        }
    }

    /// Rebuilds a detached session from encoded data.
    ///
    /// The session belongs to no store until [`activate`](Self::activate)
    /// is called.
    pub fn from_data(data: SessionData) -> Self {
        let state = if data.is_new {
            SessionState::New
        } else {
            SessionState::Active
        };
        Self {
            id: data.id,
            created: data.created,
            inner: Mutex::new(Inner {
                state,
                invalidating: false,
                last_accessed: data.last_accessed,
                max_inactive_secs: data.max_inactive_secs,
                distributable: data.distributable,
                attributes: data
                    .attributes
                    .into_iter()
                    .map(|(k, v)| (k, AttributeValue::from(v)))
                    .collect(),
                requests: HashSet::new(),
                store: Weak::new(),
            }),
        }
    }

    /// Snapshot of the session for persistence or transfer.
    ///
    /// Attributes that cannot be serialised are skipped with a warning.
    pub fn to_data(&self) -> Result<SessionData> {
        let inner = self.inner()?;
        let mut attributes = Vec::with_capacity(inner.attributes.len());
        for (name, value) in &inner.attributes {
            match value.to_stored() {
                Some(stored) => attributes.push((name.clone(), stored)),
                None => {
                    warn!(session = %self.id, attribute = %name, "skipping attribute that cannot be serialised");
                }
            }
        }
        attributes.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(SessionData {
            id: self.id.clone(),
            created: self.created,
            last_accessed: inner.last_accessed,
            max_inactive_secs: inner.max_inactive_secs,
            is_new: inner.state == SessionState::New,
            distributable: inner.distributable,
            attributes,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn creation_time(&self) -> DateTime<Utc> {
        millis_to_time(self.created)
    }

    pub fn last_accessed_time(&self) -> DateTime<Utc> {
        millis_to_time(self.lock().last_accessed)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn is_valid(&self) -> bool {
        self.lock().state.is_valid()
    }

    pub fn is_distributable(&self) -> bool {
        self.lock().distributable
    }

    /// Returns true until the client joins the session.
    pub fn is_new(&self) -> Result<bool> {
        Ok(self.valid_inner()?.state == SessionState::New)
    }

    /// Seconds of inactivity before the session expires. Zero or negative
    /// disables expiry.
    pub fn max_inactive_interval(&self) -> i32 {
        self.lock().max_inactive_secs
    }

    pub fn set_max_inactive_interval(&self, secs: i32) {
        self.lock().max_inactive_secs = secs;
    }

    /// Records an access by the client, moving a new session to active.
    pub fn touch(&self) -> Result<()> {
        let mut inner = self.valid_inner()?;
        inner.last_accessed = now_millis();
        inner.state = SessionState::Active;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expiry
    // ------------------------------------------------------------------

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// True iff expiry is enabled and more than the interval has elapsed
    /// since the last access.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        let inner = self.lock();
        is_expired(inner.last_accessed, inner.max_inactive_secs, now_millis)
    }

    // ------------------------------------------------------------------
    // Requests in flight
    // ------------------------------------------------------------------

    /// Marks the session as used by request `request_id`.
    pub fn add_using_request(&self, request_id: u64) {
        self.lock().requests.insert(request_id);
    }

    pub fn remove_using_request(&self, request_id: u64) {
        self.lock().requests.remove(&request_id);
    }

    pub fn is_in_use(&self) -> bool {
        !self.lock().requests.is_empty()
    }

    // ------------------------------------------------------------------
    // Attributes
    // ------------------------------------------------------------------

    pub fn get_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        Ok(self.valid_inner()?.attributes.get(name).cloned())
    }

    pub fn attribute_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<_> = self.valid_inner()?.attributes.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Stores `value` under `name`. `None` removes the attribute.
    ///
    /// Notification order: the new value's `value_bound`, the swap, the old
    /// value's `value_unbound`, then `attribute_added` or
    /// `attribute_replaced`.
    pub fn set_attribute(
        &self,
        name: &str,
        value: impl Into<Option<AttributeValue>>,
    ) -> Result<()> {
        let Some(value) = value.into() else {
            return self.remove_attribute(name).map(drop);
        };

        let store = self.writable_inner()?.store.clone();
        let (context, listeners) = callbacks(&store);
        let event = SessionBindingEvent {
            context: &context,
            session: self,
            name,
        };

        if let Some(obj) = value.as_object() {
            obj.value_bound(&event);
        }

        // The session may have been invalidated while the bound callback
        // ran; the binding is then undone.
        let old = match self.writable_inner() {
            Ok(mut inner) => inner.attributes.insert(name.to_owned(), value.clone()),
            Err(e) => {
                if let Some(obj) = value.as_object() {
                    obj.value_unbound(&event);
                }
                return Err(e);
            }
        };

        if let Some(obj) = old.as_ref().and_then(AttributeValue::as_object) {
            obj.value_unbound(&event);
        }
        for listener in listeners.attribute_listeners() {
            match &old {
                Some(old) => listener.attribute_replaced(&context, self, name, old),
                None => listener.attribute_added(&context, self, name, &value),
            }
        }
        Ok(())
    }

    /// Removes and returns the attribute `name`.
    pub fn remove_attribute(&self, name: &str) -> Result<Option<AttributeValue>> {
        let (removed, store) = {
            let mut inner = self.valid_inner()?;
            (inner.attributes.remove(name), inner.store.clone())
        };
        if let Some(value) = &removed {
            let (context, listeners) = callbacks(&store);
            self.notify_removed(&context, &listeners, name, value);
        }
        Ok(removed)
    }

    fn notify_removed(
        &self,
        context: &ExecutionContext,
        listeners: &SessionListeners,
        name: &str,
        value: &AttributeValue,
    ) {
        if let Some(obj) = value.as_object() {
            obj.value_unbound(&SessionBindingEvent {
                context,
                session: self,
                name,
            });
        }
        for listener in listeners.attribute_listeners() {
            listener.attribute_removed(context, self, name, value);
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Destroys the session.
    ///
    /// Session listeners hear `session_destroyed` in reverse registration
    /// order while the attributes are still readable. Every attribute is
    /// then removed with the usual unbound notifications, and the session
    /// leaves its store.
    ///
    /// From the moment invalidation starts, attributes can still be read
    /// and removed but no longer set.
    pub fn invalidate(&self) -> Result<()> {
        let store = {
            let mut inner = self.writable_inner()?;
            inner.invalidating = true;
            inner.store.clone()
        };

        let (context, listeners) = callbacks(&store);
        for listener in listeners.session_listeners().iter().rev() {
            listener.session_destroyed(&context, self);
        }

        let drained: Vec<_> = self.inner()?.attributes.drain().collect();
        for (name, value) in &drained {
            self.notify_removed(&context, &listeners, name, value);
        }

        {
            let mut inner = self.inner()?;
            inner.state = SessionState::Invalidated;
            inner.invalidating = false;
            inner.requests.clear();
            inner.store = Weak::new();
        }
        if let Some(store) = store.upgrade() {
            store.remove_session(&self.id);
        }
        debug!(session = %self.id, context = %context, "session invalidated");
        Ok(())
    }

    /// Suspends the session for transfer to another node.
    ///
    /// Activation listeners hear `session_will_passivate`, the attributes
    /// are dropped without unbound notifications, and the session leaves
    /// its store.
    pub fn passivate(&self) -> Result<()> {
        let store = self.writable_inner()?.store.clone();
        let (context, listeners) = callbacks(&store);
        for listener in listeners.activation_listeners() {
            listener.session_will_passivate(&context, self);
        }

        {
            let mut inner = self.inner()?;
            inner.attributes.clear();
            inner.requests.clear();
            inner.state = SessionState::Passivated;
            inner.store = Weak::new();
        }
        if let Some(store) = store.upgrade() {
            store.remove_session(&self.id);
        }
        debug!(session = %self.id, context = %context, "session passivated");
        Ok(())
    }

    /// Attaches the session to `store` and notifies its activation
    /// listeners with `session_did_activate`.
    pub fn activate(self: &Arc<Self>, store: &SessionStore) -> Result<()> {
        self.valid_inner()?.store = store.weak();
        store.insert(Arc::clone(self));

        let context = store.execution_context();
        for listener in store.listeners().activation_listeners() {
            listener.session_did_activate(&context, self);
        }
        debug!(session = %self.id, context = %context, "session activated");
        Ok(())
    }

    fn inner(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| SessionError::LockPoisoned)
    }

    /// Locks the session, failing if it is no longer valid.
    fn valid_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.inner()?;
        if !inner.state.is_valid() {
            return Err(SessionError::InvalidState(self.id.clone()));
        }
        Ok(inner)
    }

    /// Like `valid_inner`, but also fails once invalidation has started.
    fn writable_inner(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.valid_inner()?;
        if inner.invalidating {
            return Err(SessionError::InvalidState(self.id.clone()));
        }
        Ok(inner)
    }

    // Read-only accessors tolerate poisoning.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("attributes", &inner.attributes.len())
            .field("max_inactive_secs", &inner.max_inactive_secs)
            .finish_non_exhaustive()
    }
}

pub(crate) fn is_expired(last_accessed: i64, max_inactive_secs: i32, now_millis: i64) -> bool {
    max_inactive_secs > 0 && now_millis - last_accessed > i64::from(max_inactive_secs) * 1000
}

fn millis_to_time(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// The callback context and listeners of the session's store, if any.
fn callbacks(store: &Weak<SessionStore>) -> (ExecutionContext, SessionListeners) {
    match store.upgrade() {
        Some(store) => (store.execution_context(), store.listeners().clone()),
        None => (ExecutionContext::default(), SessionListeners::default()),
    }
}
