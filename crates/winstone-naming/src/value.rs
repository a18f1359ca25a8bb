//! Values that can be bound in a naming context.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::context::NamingContext;

/// An alias to another name, followed only by `lookup_link`.
///
/// Link names starting with `./` resolve relative to the context holding
/// the link; anything else resolves from the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRef {
    link_name: String,
}

impl LinkRef {
    /// Creates a link to `link_name`.
    pub fn new(link_name: impl Into<String>) -> Self {
        Self {
            link_name: link_name.into(),
        }
    }

    /// The aliased name.
    pub fn link_name(&self) -> &str {
        &self.link_name
    }

    /// Returns the context-relative part if this is a `./` link.
    pub fn relative_target(&self) -> Option<&str> {
        self.link_name.strip_prefix("./")
    }
}

/// An arbitrary shared object together with the name of its type.
#[derive(Clone)]
pub struct BoundObject {
    value: Arc<dyn Any + Send + Sync>,
    class_name: &'static str,
}

impl BoundObject {
    /// Wraps `value`, remembering its type name.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    /// Wraps an already shared value.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            class_name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the wrapped value.
    pub fn class_name(&self) -> &'static str {
        self.class_name
    }

    /// Borrows the value as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Clones the shared handle as `Arc<T>`.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }
}

impl fmt::Debug for BoundObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundObject")
            .field("class_name", &self.class_name)
            .finish_non_exhaustive()
    }
}

/// A binding's value: a leaf object, a nested context, or a link.
#[derive(Debug, Clone)]
pub enum NamingValue {
    /// A nested context owned by the binding context.
    Context(Arc<NamingContext>),
    /// An alias to another name.
    Link(LinkRef),
    /// A leaf object.
    Object(BoundObject),
}

impl NamingValue {
    /// Wraps an arbitrary value as a leaf object.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Self::Object(BoundObject::new(value))
    }

    /// Type name reported by `list`.
    pub fn class_name(&self) -> &'static str {
        match self {
            Self::Context(_) => std::any::type_name::<NamingContext>(),
            Self::Link(_) => std::any::type_name::<LinkRef>(),
            Self::Object(obj) => obj.class_name(),
        }
    }

    /// Borrows a leaf object as `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => obj.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Clones a leaf object's handle as `Arc<T>`.
    pub fn downcast_arc<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Self::Object(obj) => obj.downcast_arc::<T>(),
            _ => None,
        }
    }

    /// Returns the nested context, if this is one.
    pub fn as_context(&self) -> Option<&Arc<NamingContext>> {
        match self {
            Self::Context(ctx) => Some(ctx),
            _ => None,
        }
    }

    /// Returns the link, if this is one.
    pub fn as_link(&self) -> Option<&LinkRef> {
        match self {
            Self::Link(link) => Some(link),
            _ => None,
        }
    }
}

impl From<LinkRef> for NamingValue {
    fn from(link: LinkRef) -> Self {
        Self::Link(link)
    }
}

impl From<Arc<NamingContext>> for NamingValue {
    fn from(ctx: Arc<NamingContext>) -> Self {
        Self::Context(ctx)
    }
}

impl From<BoundObject> for NamingValue {
    fn from(obj: BoundObject) -> Self {
        Self::Object(obj)
    }
}
