//! The mutable naming tree.
//!
//! Each [`NamingContext`] owns its child contexts through its bindings map
//! and holds only a weak handle to its parent. Mutations are serialised by a
//! lock scoped to the context's bindings; resolution of a multi-component
//! name takes each context's lock only long enough to read the next hop, so
//! operations on unrelated branches proceed in parallel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use tracing::debug;

use crate::enumeration::{Binding, NameClassPair, NameEnumeration};
use crate::error::{NamingError, Result};
use crate::name::{CompositeName, FIRST_CHILD, ROOT_NAME, SCHEME, SHORT_PREFIX};
use crate::value::{LinkRef, NamingValue};

/// Maximum number of link hops followed by `lookup_link`.
pub const MAX_LINK_DEPTH: usize = 16;

type Bindings = Arc<RwLock<HashMap<String, NamingValue>>>;

/// Outcome of normalising a name against a context.
enum Resolved {
    /// The name is relative to this context.
    Local(CompositeName),
    /// The name is absolute and lives outside this subtree.
    Parent(Arc<NamingContext>),
}

/// A node in the naming tree.
pub struct NamingContext {
    me: Weak<NamingContext>,
    parent: Weak<NamingContext>,
    atomic_name: Option<String>,
    absolute_name: String,
    bindings: Bindings,
    environment: Mutex<Option<HashMap<String, String>>>,
    closed: AtomicBool,
}

impl NamingContext {
    /// Creates a root context named [`ROOT_NAME`].
    pub fn new_root(environment: Option<HashMap<String, String>>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            parent: Weak::new(),
            atomic_name: None,
            absolute_name: ROOT_NAME.to_owned(),
            bindings: Bindings::default(),
            environment: Mutex::new(environment),
            closed: AtomicBool::new(false),
        })
    }

    /// This context's own path segment; `None` for the root.
    pub fn atomic_name(&self) -> Option<&str> {
        self.atomic_name.as_deref()
    }

    /// Absolute name of this context, e.g. `java:/comp/env/jdbc`.
    pub fn name_in_namespace(&self) -> &str {
        &self.absolute_name
    }

    /// Returns the parent context, if it is still alive.
    pub fn parent(&self) -> Option<Arc<NamingContext>> {
        self.parent.upgrade()
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    /// Resolves `name`. Links are returned as-is, not followed.
    ///
    /// An empty name returns a fresh view of this context that shares its
    /// bindings but carries an independent copy of the environment.
    pub fn lookup(&self, name: &str) -> Result<NamingValue> {
        self.lookup_name(&CompositeName::parse(name))
    }

    /// [`lookup`](Self::lookup) for an already parsed name.
    pub fn lookup_name(&self, name: &CompositeName) -> Result<NamingValue> {
        self.ensure_open()?;
        self.resolve(name)
    }

    fn resolve(&self, name: &CompositeName) -> Result<NamingValue> {
        let local = match self.validate_name(name)? {
            Resolved::Parent(parent) => return parent.resolve(name),
            Resolved::Local(local) => local,
        };

        match local.len() {
            0 => Ok(NamingValue::Context(self.view()?)),
            1 => {
                let leaf = leaf(&local)?;
                self.binding(leaf)?
                    .ok_or_else(|| NamingError::NameNotFound(self.qualify(leaf)))
            }
            _ => self.next_context(&local)?.resolve(&local.suffix(1)),
        }
    }

    /// Resolves `name`, following a final [`LinkRef`].
    ///
    /// `./`-prefixed links resolve in the context that holds the link;
    /// other links are resolved again from the root.
    pub fn lookup_link(&self, name: &str) -> Result<NamingValue> {
        self.ensure_open()?;
        self.lookup_link_name(&CompositeName::parse(name), 0)
    }

    fn lookup_link_name(&self, name: &CompositeName, depth: usize) -> Result<NamingValue> {
        if depth > MAX_LINK_DEPTH {
            return Err(NamingError::LinkLoop(name.to_string()));
        }

        let local = match self.validate_name(name)? {
            Resolved::Parent(parent) => return parent.lookup_link_name(name, depth),
            Resolved::Local(local) => local,
        };

        if local.len() > 1 {
            return self
                .next_context(&local)?
                .lookup_link_name(&local.suffix(1), depth);
        }

        match self.resolve(&local)? {
            NamingValue::Link(link) => self.follow(&link, depth),
            other => Ok(other),
        }
    }

    fn follow(&self, link: &LinkRef, depth: usize) -> Result<NamingValue> {
        if let Some(relative) = link.relative_target() {
            return self.lookup_link_name(&CompositeName::parse(relative), depth + 1);
        }
        let root = self
            .root()
            .ok_or_else(|| NamingError::Closed(self.absolute_name.clone()))?;
        root.lookup_link_name(&CompositeName::parse(link.link_name()), depth + 1)
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    /// Binds `value` under `name`; fails if the leaf is already bound.
    pub fn bind(&self, name: &str, value: impl Into<NamingValue>) -> Result<()> {
        self.ensure_open()?;
        self.bind_name(&CompositeName::parse(name), value.into(), false)
    }

    /// Binds `value` under `name`, replacing any existing binding.
    pub fn rebind(&self, name: &str, value: impl Into<NamingValue>) -> Result<()> {
        self.ensure_open()?;
        self.bind_name(&CompositeName::parse(name), value.into(), true)
    }

    /// Binds an arbitrary object under `name`.
    pub fn bind_object<T>(&self, name: &str, value: T) -> Result<()>
    where
        T: std::any::Any + Send + Sync,
    {
        self.bind(name, NamingValue::object(value))
    }

    /// Rebinds an arbitrary object under `name`.
    pub fn rebind_object<T>(&self, name: &str, value: T) -> Result<()>
    where
        T: std::any::Any + Send + Sync,
    {
        self.rebind(name, NamingValue::object(value))
    }

    fn bind_name(&self, name: &CompositeName, value: NamingValue, overwrite: bool) -> Result<()> {
        let local = match self.validate_name(name)? {
            Resolved::Parent(parent) => return parent.bind_name(name, value, overwrite),
            Resolved::Local(local) => local,
        };

        if local.len() > 1 {
            return self
                .next_context(&local)?
                .bind_name(&local.suffix(1), value, overwrite);
        }

        let leaf = leaf(&local)?;
        let mut bindings = self.write_bindings()?;
        if !overwrite && bindings.contains_key(leaf) {
            return Err(NamingError::NameAlreadyBound(self.qualify(leaf)));
        }
        bindings.insert(leaf.to_owned(), value);
        debug!(name = %self.qualify(leaf), overwrite, "bound name");
        Ok(())
    }

    /// Removes the binding for `name`.
    ///
    /// Removing an absent leaf is not an error, but every intermediate
    /// component must still resolve to a context.
    pub fn unbind(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.unbind_name(&CompositeName::parse(name)).map(drop)
    }

    fn unbind_name(&self, name: &CompositeName) -> Result<Option<NamingValue>> {
        let local = match self.validate_name(name)? {
            Resolved::Parent(parent) => return parent.unbind_name(name),
            Resolved::Local(local) => local,
        };

        if local.len() > 1 {
            return self.next_context(&local)?.unbind_name(&local.suffix(1));
        }

        let leaf = leaf(&local)?;
        let removed = self.write_bindings()?.remove(leaf);
        if removed.is_some() {
            debug!(name = %self.qualify(leaf), "unbound name");
        }
        Ok(removed)
    }

    /// Renames a binding within a single context.
    ///
    /// On failure the original binding is left untouched.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.ensure_open()?;
        self.rename_names(&CompositeName::parse(old_name), &CompositeName::parse(new_name))
    }

    fn rename_names(&self, old_name: &CompositeName, new_name: &CompositeName) -> Result<()> {
        let (old_local, new_local) = match (self.validate_name(old_name)?, self.validate_name(new_name)?) {
            (Resolved::Local(old), Resolved::Local(new)) => (old, new),
            (Resolved::Parent(parent), Resolved::Parent(_)) => {
                return parent.rename_names(old_name, new_name);
            }
            _ => {
                return Err(NamingError::OperationNotSupported(format!(
                    "cannot rename {old_name} to {new_name} across contexts"
                )));
            }
        };

        if old_local.is_empty() || new_local.is_empty() {
            return Err(NamingError::InvalidName(format!(
                "cannot rename {old_name} to {new_name}"
            )));
        }
        if old_local.prefix(old_local.len() - 1) != new_local.prefix(new_local.len() - 1) {
            return Err(NamingError::OperationNotSupported(format!(
                "cannot rename {old_name} to {new_name} across contexts"
            )));
        }

        if old_local.len() > 1 {
            return self
                .next_context(&old_local)?
                .rename_names(&old_local.suffix(1), &new_local.suffix(1));
        }

        let (old_leaf, new_leaf) = (leaf(&old_local)?, leaf(&new_local)?);
        let mut bindings = self.write_bindings()?;
        if bindings.contains_key(new_leaf) {
            return Err(NamingError::NameAlreadyBound(self.qualify(new_leaf)));
        }
        let value = bindings
            .remove(old_leaf)
            .ok_or_else(|| NamingError::NameNotFound(self.qualify(old_leaf)))?;
        bindings.insert(new_leaf.to_owned(), value);
        debug!(from = %self.qualify(old_leaf), to = %self.qualify(new_leaf), "renamed binding");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sub-contexts
    // ------------------------------------------------------------------

    /// Creates and binds a new child context at `name`.
    pub fn create_subcontext(&self, name: &str) -> Result<Arc<NamingContext>> {
        self.ensure_open()?;
        self.create_subcontext_name(&CompositeName::parse(name))
    }

    fn create_subcontext_name(&self, name: &CompositeName) -> Result<Arc<NamingContext>> {
        let local = match self.validate_name(name)? {
            Resolved::Parent(parent) => return parent.create_subcontext_name(name),
            Resolved::Local(local) => local,
        };

        if local.len() > 1 {
            return self
                .next_context(&local)?
                .create_subcontext_name(&local.suffix(1));
        }

        let leaf = leaf(&local)?;
        let child = self.child(leaf)?;
        let mut bindings = self.write_bindings()?;
        if bindings.contains_key(leaf) {
            return Err(NamingError::NameAlreadyBound(self.qualify(leaf)));
        }
        bindings.insert(leaf.to_owned(), NamingValue::Context(Arc::clone(&child)));
        debug!(name = %child.absolute_name, "created subcontext");
        Ok(child)
    }

    /// Unbinds the child context at `name` and closes it.
    pub fn destroy_subcontext(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let name = CompositeName::parse(name);
        if let Resolved::Local(local) = self.validate_name(&name)? {
            if local.is_empty() {
                return Err(NamingError::InvalidName(format!(
                    "{} cannot destroy itself",
                    self.absolute_name
                )));
            }
        }
        if let Some(NamingValue::Context(child)) = self.unbind_name(&name)? {
            child.close();
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Enumeration
    // ------------------------------------------------------------------

    /// Lists names and class names bound in the context at `name`.
    pub fn list(&self, name: &str) -> Result<NameEnumeration<NameClassPair>> {
        let pairs = self
            .snapshot(name)?
            .into_iter()
            .map(|(name, value)| NameClassPair {
                class_name: value.class_name(),
                name,
            })
            .collect();
        Ok(NameEnumeration::new(pairs))
    }

    /// Lists names and bound values in the context at `name`.
    pub fn list_bindings(&self, name: &str) -> Result<NameEnumeration<Binding>> {
        let bindings = self
            .snapshot(name)?
            .into_iter()
            .map(|(name, value)| Binding { name, value })
            .collect();
        Ok(NameEnumeration::new(bindings))
    }

    fn snapshot(&self, name: &str) -> Result<Vec<(String, NamingValue)>> {
        let target = match self.lookup_name(&CompositeName::parse(name))? {
            NamingValue::Context(ctx) => ctx,
            _ => return Err(NamingError::NotAContext(name.to_owned())),
        };
        let mut entries: Vec<_> = target
            .read_bindings()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Environment
    // ------------------------------------------------------------------

    /// Copy of this context's environment.
    pub fn environment(&self) -> HashMap<String, String> {
        self.environment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default()
    }

    /// Sets an environment property, returning the previous value.
    pub fn add_to_environment(&self, key: &str, value: &str) -> Result<Option<String>> {
        let mut env = self
            .environment
            .lock()
            .map_err(|_| NamingError::LockPoisoned)?;
        Ok(env
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value.to_owned()))
    }

    /// Removes an environment property, returning its value.
    pub fn remove_from_environment(&self, key: &str) -> Result<Option<String>> {
        let mut env = self
            .environment
            .lock()
            .map_err(|_| NamingError::LockPoisoned)?;
        Ok(env.as_mut().and_then(|e| e.remove(key)))
    }

    /// Joins `name` onto `prefix`.
    pub fn compose_name(&self, name: &str, prefix: &str) -> String {
        let mut composed = CompositeName::parse(prefix);
        composed.extend(&CompositeName::parse(name));
        composed.to_string()
    }

    /// Closes this context instance. Bindings are left to the owner; the
    /// environment is dropped and further operations fail with `Closed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.environment
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            debug!(name = %self.absolute_name, "closed context");
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Normalises `name` against this context.
    ///
    /// Relative names pass through. Absolute names inside this subtree are
    /// rewritten relative to it; absolute names elsewhere are handed to the
    /// parent, or fail if there is none.
    fn validate_name(&self, name: &CompositeName) -> Result<Resolved> {
        match name.get(0) {
            Some(SHORT_PREFIX) => {
                let mut rewritten = CompositeName::from_components([SCHEME, FIRST_CHILD]);
                rewritten.extend(&name.suffix(1));
                self.validate_name(&rewritten)
            }
            Some(SCHEME) => {
                let full = name.to_string();
                if full == self.absolute_name {
                    return Ok(Resolved::Local(CompositeName::default()));
                }
                if let Some(rest) = full
                    .strip_prefix(self.absolute_name.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                {
                    return Ok(Resolved::Local(CompositeName::parse(rest)));
                }
                match self.parent.upgrade() {
                    Some(parent) => Ok(Resolved::Parent(parent)),
                    None => Err(NamingError::NameNotFound(full)),
                }
            }
            _ => Ok(Resolved::Local(name.clone())),
        }
    }

    /// Resolves the first component of a multi-component name to a context.
    fn next_context(&self, name: &CompositeName) -> Result<Arc<NamingContext>> {
        let first = name
            .get(0)
            .ok_or_else(|| NamingError::InvalidName(String::new()))?;
        match self.binding(first)? {
            Some(NamingValue::Context(ctx)) => Ok(ctx),
            Some(_) => Err(NamingError::NotAContext(self.qualify(first))),
            None => Err(NamingError::NameNotFound(self.qualify(first))),
        }
    }

    fn binding(&self, segment: &str) -> Result<Option<NamingValue>> {
        Ok(self.read_bindings()?.get(segment).cloned())
    }

    fn read_bindings(&self) -> Result<RwLockReadGuard<'_, HashMap<String, NamingValue>>> {
        self.bindings.read().map_err(|_| NamingError::LockPoisoned)
    }

    fn write_bindings(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, NamingValue>>> {
        self.bindings.write().map_err(|_| NamingError::LockPoisoned)
    }

    fn child(&self, segment: &str) -> Result<Arc<NamingContext>> {
        let environment = self
            .environment
            .lock()
            .map_err(|_| NamingError::LockPoisoned)?
            .clone();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            parent: self.me.clone(),
            atomic_name: Some(segment.to_owned()),
            absolute_name: format!("{}/{segment}", self.absolute_name),
            bindings: Bindings::default(),
            environment: Mutex::new(environment),
            closed: AtomicBool::new(false),
        }))
    }

    /// A second handle on this context: shared bindings, copied environment.
    fn view(&self) -> Result<Arc<NamingContext>> {
        let environment = self
            .environment
            .lock()
            .map_err(|_| NamingError::LockPoisoned)?
            .clone();
        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            parent: self.parent.clone(),
            atomic_name: self.atomic_name.clone(),
            absolute_name: self.absolute_name.clone(),
            bindings: Arc::clone(&self.bindings),
            environment: Mutex::new(environment),
            closed: AtomicBool::new(false),
        }))
    }

    fn root(&self) -> Option<Arc<NamingContext>> {
        let mut current = self.me.upgrade()?;
        while let Some(parent) = current.parent.upgrade() {
            current = parent;
        }
        Some(current)
    }

    fn qualify(&self, segment: &str) -> String {
        format!("{}/{segment}", self.absolute_name)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(NamingError::Closed(self.absolute_name.clone()));
        }
        Ok(())
    }
}

fn leaf(name: &CompositeName) -> Result<&str> {
    name.last()
        .ok_or_else(|| NamingError::InvalidName("empty name".to_owned()))
}

impl fmt::Debug for NamingContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamingContext")
            .field("name", &self.absolute_name)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
