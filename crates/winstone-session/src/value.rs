//! Session attribute values.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::codec::MAX_VALUE_DEPTH;
use crate::listener::SessionBindingEvent;

/// An application object stored in a session.
///
/// Objects are shared, never serialised: a session holding one cannot carry
/// it across a save or a cluster transfer. The binding callbacks fire when
/// the object is put into or taken out of a session.
pub trait SessionObject: Any + Send + Sync + fmt::Debug {
    /// Called before the object replaces any previous value.
    fn value_bound(&self, _event: &SessionBindingEvent<'_>) {}

    /// Called after the object has been replaced or removed.
    fn value_unbound(&self, _event: &SessionBindingEvent<'_>) {}
}

/// A value stored under a session attribute name.
#[derive(Clone)]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Bytes),
    List(Vec<AttributeValue>),
    /// A shared application object. Not serialisable.
    Object(Arc<dyn SessionObject>),
}

impl AttributeValue {
    /// Wraps an application object.
    pub fn object(value: impl SessionObject) -> Self {
        Self::Object(Arc::new(value))
    }

    /// Returns true if the value survives persistence and cluster transfer.
    pub fn is_serializable(&self) -> bool {
        match self {
            Self::Object(_) => false,
            Self::List(items) => items.iter().all(Self::is_serializable),
            _ => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrows an application object as `T`.
    pub fn downcast_ref<T: SessionObject>(&self) -> Option<&T> {
        match self {
            Self::Object(obj) => (obj.as_ref() as &dyn Any).downcast_ref::<T>(),
            _ => None,
        }
    }

    pub(crate) fn as_object(&self) -> Option<&Arc<dyn SessionObject>> {
        match self {
            Self::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// The serialisable form, or `None` for objects and for lists nested
    /// deeper than the codec accepts.
    pub(crate) fn to_stored(&self) -> Option<StoredValue> {
        self.to_stored_at(1)
    }

    fn to_stored_at(&self, depth: usize) -> Option<StoredValue> {
        Some(match self {
            Self::Str(s) => StoredValue::Str(s.clone()),
            Self::Int(n) => StoredValue::Int(*n),
            Self::Float(f) => StoredValue::Float(*f),
            Self::Bool(b) => StoredValue::Bool(*b),
            Self::Bytes(b) => StoredValue::Bytes(b.clone()),
            Self::List(_) if depth > MAX_VALUE_DEPTH => return None,
            Self::List(items) => StoredValue::List(
                items
                    .iter()
                    .map(|item| item.to_stored_at(depth + 1))
                    .collect::<Option<_>>()?,
            ),
            Self::Object(_) => return None,
        })
    }
}

impl fmt::Debug for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Self::Float(x) => f.debug_tuple("Float").field(x).finish(),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Object(obj) => f.debug_tuple("Object").field(obj).finish(),
        }
    }
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<f64> for AttributeValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Bytes> for AttributeValue {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

/// Serialisable mirror of [`AttributeValue`], written with postcard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum StoredValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Bytes),
    List(Vec<StoredValue>),
}

impl From<StoredValue> for AttributeValue {
    fn from(value: StoredValue) -> Self {
        match value {
            StoredValue::Str(s) => Self::Str(s),
            StoredValue::Int(n) => Self::Int(n),
            StoredValue::Float(x) => Self::Float(x),
            StoredValue::Bool(b) => Self::Bool(b),
            StoredValue::Bytes(b) => Self::Bytes(b),
            StoredValue::List(items) => Self::List(items.into_iter().map(Self::from).collect()),
        }
    }
}
