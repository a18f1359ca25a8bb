//! One-shot enumerations returned by `list` and `list_bindings`.

use crate::value::NamingValue;

/// A `{name, class name}` pair yielded by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameClassPair {
    pub name: String,
    pub class_name: &'static str,
}

/// A `{name, bound object}` pair yielded by `list_bindings`.
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub value: NamingValue,
}

impl Binding {
    /// Type name of the bound value.
    pub fn class_name(&self) -> &'static str {
        self.value.class_name()
    }
}

/// Forward-only enumeration over a snapshot of a context's bindings.
///
/// The snapshot is taken when the enumeration is created, so later changes
/// to the context are not observed. Once exhausted or closed, the
/// enumeration yields nothing further and cannot be restarted.
#[derive(Debug)]
pub struct NameEnumeration<T> {
    items: Option<std::vec::IntoIter<T>>,
}

impl<T> NameEnumeration<T> {
    pub(crate) fn new(items: Vec<T>) -> Self {
        Self {
            items: Some(items.into_iter()),
        }
    }

    /// Releases the remaining entries. Subsequent calls to `next` return
    /// `None`.
    pub fn close(&mut self) {
        self.items = None;
    }

    /// Returns true if more entries remain.
    pub fn has_more(&self) -> bool {
        self.items.as_ref().is_some_and(|it| it.len() > 0)
    }
}

impl<T> Iterator for NameEnumeration<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        let next = self.items.as_mut()?.next();
        if next.is_none() {
            self.items = None;
        }
        next
    }
}
