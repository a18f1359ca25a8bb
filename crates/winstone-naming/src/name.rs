//! Composite names.
//!
//! A composite name is a `/`-separated sequence of atomic components. The
//! `java:` scheme marker is kept as its own leading component, so
//! `java:/comp/env/jdbc/main` parses to `["java:", "comp", "env", "jdbc",
//! "main"]`. The short form `java:comp/env` is rewritten to the same shape
//! during validation.

use std::fmt;

/// Scheme marker that makes a name absolute.
pub const SCHEME: &str = "java:";

/// First component under the scheme.
pub const FIRST_CHILD: &str = "comp";

/// Short form that glues the scheme and first child together.
pub const SHORT_PREFIX: &str = "java:comp";

/// Absolute name of the environment root context.
pub const ROOT_NAME: &str = "java:/comp/env";

/// Separator between components.
pub const SEPARATOR: char = '/';

/// An ordered list of name components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CompositeName {
    components: Vec<String>,
}

impl CompositeName {
    /// Parses a string name. Empty components are dropped.
    pub fn parse(name: &str) -> Self {
        Self {
            components: name
                .split(SEPARATOR)
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    /// Builds a name from already-split components.
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if the name has no components.
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Returns component `index`, if present.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }

    /// Returns the last component, if any.
    pub fn last(&self) -> Option<&str> {
        self.components.last().map(String::as_str)
    }

    /// The first `count` components.
    pub fn prefix(&self, count: usize) -> Self {
        Self {
            components: self.components[..count.min(self.len())].to_vec(),
        }
    }

    /// Everything from component `start` onwards.
    pub fn suffix(&self, start: usize) -> Self {
        Self {
            components: self.components[start.min(self.len())..].to_vec(),
        }
    }

    /// Appends a component.
    pub fn push(&mut self, component: impl Into<String>) {
        self.components.push(component.into());
    }

    /// Appends every component of `other`.
    pub fn extend(&mut self, other: &Self) {
        self.components.extend(other.components.iter().cloned());
    }

    /// Iterates over the components.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.components.iter().map(String::as_str)
    }

    /// Returns true if the name starts with the scheme marker.
    pub fn is_absolute(&self) -> bool {
        matches!(self.get(0), Some(SCHEME | SHORT_PREFIX))
    }
}

impl fmt::Display for CompositeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(component)?;
        }
        Ok(())
    }
}

impl From<&str> for CompositeName {
    fn from(name: &str) -> Self {
        Self::parse(name)
    }
}
