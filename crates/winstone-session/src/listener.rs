//! Session lifecycle listeners.
//!
//! Every callback receives the [`ExecutionContext`] of the web application
//! that registered it. Callbacks never run while a session lock is held,
//! so a listener may freely call back into the session it is notified
//! about.

use std::fmt;
use std::sync::Arc;

use crate::session::Session;
use crate::value::AttributeValue;

/// Identifies the web application a callback runs on behalf of.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ExecutionContext {
    pub host: String,
    pub context_path: String,
}

impl ExecutionContext {
    pub fn new(host: impl Into<String>, context_path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            context_path: context_path.into(),
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.host, self.context_path)
    }
}

/// Passed to [`SessionObject`](crate::SessionObject) binding callbacks.
#[derive(Debug)]
pub struct SessionBindingEvent<'a> {
    pub context: &'a ExecutionContext,
    pub session: &'a Session,
    pub name: &'a str,
}

/// Notified when sessions are created and destroyed.
pub trait SessionListener: Send + Sync {
    fn session_created(&self, _context: &ExecutionContext, _session: &Session) {}

    /// Runs before the session's attributes are removed.
    fn session_destroyed(&self, _context: &ExecutionContext, _session: &Session) {}
}

/// Notified when session attributes change.
pub trait SessionAttributeListener: Send + Sync {
    fn attribute_added(
        &self,
        _context: &ExecutionContext,
        _session: &Session,
        _name: &str,
        _value: &AttributeValue,
    ) {
    }

    /// `old_value` is the value that was replaced.
    fn attribute_replaced(
        &self,
        _context: &ExecutionContext,
        _session: &Session,
        _name: &str,
        _old_value: &AttributeValue,
    ) {
    }

    fn attribute_removed(
        &self,
        _context: &ExecutionContext,
        _session: &Session,
        _name: &str,
        _value: &AttributeValue,
    ) {
    }
}

/// Notified around cluster hand-off.
pub trait SessionActivationListener: Send + Sync {
    fn session_will_passivate(&self, _context: &ExecutionContext, _session: &Session) {}
    fn session_did_activate(&self, _context: &ExecutionContext, _session: &Session) {}
}

/// The listeners registered by one web application.
#[derive(Clone, Default)]
pub struct SessionListeners {
    session: Vec<Arc<dyn SessionListener>>,
    attribute: Vec<Arc<dyn SessionAttributeListener>>,
    activation: Vec<Arc<dyn SessionActivationListener>>,
}

impl SessionListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.session.push(listener);
        self
    }

    pub fn with_attribute_listener(mut self, listener: Arc<dyn SessionAttributeListener>) -> Self {
        self.attribute.push(listener);
        self
    }

    pub fn with_activation_listener(mut self, listener: Arc<dyn SessionActivationListener>) -> Self {
        self.activation.push(listener);
        self
    }

    pub fn session_listeners(&self) -> &[Arc<dyn SessionListener>] {
        &self.session
    }

    pub fn attribute_listeners(&self) -> &[Arc<dyn SessionAttributeListener>] {
        &self.attribute
    }

    pub fn activation_listeners(&self) -> &[Arc<dyn SessionActivationListener>] {
        &self.activation
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.attribute.is_empty() && self.activation.is_empty()
    }
}

impl fmt::Debug for SessionListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionListeners")
            .field("session", &self.session.len())
            .field("attribute", &self.attribute.len())
            .field("activation", &self.activation.len())
            .finish()
    }
}
