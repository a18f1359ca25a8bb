//! # winstone-session: HTTP sessions
//!
//! A [`SessionStore`] holds the live [`Session`]s of one web application.
//! Sessions carry typed attributes, expire after a period of inactivity,
//! notify the application's listeners about lifecycle and attribute
//! changes, and can be saved to the temp directory or handed to another
//! cluster node.
//!
//! ```
//! use winstone_session::{AttributeValue, SessionStore, StoreConfig};
//!
//! let store = SessionStore::new(StoreConfig::new("localhost", "/shop", std::env::temp_dir()));
//! let session = store.create_session();
//! session.set_attribute("user", AttributeValue::from("ada")).unwrap();
//! assert_eq!(
//!     session.get_attribute("user").unwrap(),
//!     Some(AttributeValue::from("ada"))
//! );
//!
//! session.invalidate().unwrap();
//! assert!(session.get_attribute("user").is_err());
//! assert!(store.is_empty());
//! ```

mod codec;
mod error;
mod listener;
mod session;
mod store;
mod value;

pub use codec::{FORMAT_VERSION, MAX_VALUE_DEPTH, SessionData, is_valid_session_id};
pub use error::{Result, SessionError};
pub use listener::{
    ExecutionContext, SessionActivationListener, SessionAttributeListener, SessionBindingEvent,
    SessionListener, SessionListeners,
};
pub use session::{Session, SessionState, now_millis};
pub use store::{Cluster, SESSION_FILE_EXTENSION, SESSIONS_DIR, SessionStore, StoreConfig};
pub use value::{AttributeValue, SessionObject};

#[cfg(test)]
mod tests;
