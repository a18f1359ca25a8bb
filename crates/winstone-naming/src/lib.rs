//! # winstone-naming: JNDI-style naming contexts
//!
//! A mutable, hierarchical name-to-object binding tree. Names are composite
//! (`jdbc/main`), optionally absolute (`java:comp/env/jdbc/main`), and may
//! resolve through nested contexts and link aliases.
//!
//! ```text
//! java:/comp/env            (root)
//! ├── jdbc                  (NamingContext)
//! │   └── main              (BoundObject: data source)
//! ├── mail/Session          (BoundObject)
//! └── db                    (LinkRef -> "jdbc/main")
//! ```
//!
//! # Example
//!
//! ```
//! use winstone_naming::{LinkRef, NamingContext};
//!
//! let root = NamingContext::new_root(None);
//! root.create_subcontext("jdbc").unwrap();
//! root.bind_object("jdbc/main", 42_u32).unwrap();
//! root.bind("db", LinkRef::new("jdbc/main")).unwrap();
//!
//! let value = root.lookup_link("java:comp/env/db").unwrap();
//! assert_eq!(value.downcast_ref::<u32>(), Some(&42));
//! ```

mod context;
mod enumeration;
mod error;
mod name;
mod value;

pub use context::{MAX_LINK_DEPTH, NamingContext};
pub use enumeration::{Binding, NameClassPair, NameEnumeration};
pub use error::{NamingError, Result};
pub use name::{CompositeName, FIRST_CHILD, ROOT_NAME, SCHEME, SEPARATOR, SHORT_PREFIX};
pub use value::{BoundObject, LinkRef, NamingValue};

#[cfg(test)]
mod tests;
