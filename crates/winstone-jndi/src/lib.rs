//! # winstone-jndi: environment resources for web applications
//!
//! [`JndiManager`] owns the `java:/comp/env` naming tree and binds the
//! resources declared in configuration:
//!
//! - pooled data sources under `jdbc/`, with optional keep-alive and
//!   inactive-connection maintenance on a background [`Scheduler`],
//! - mail sessions built by a [`MailSessionFactory`],
//! - simple environment entries built from a class name and a string value
//!   by the [`ObjectFactoryRegistry`].
//!
//! Connection drivers are registered by name in a [`DriverRegistry`].

mod datasource;
mod error;
mod manager;
mod resources;
mod scheduler;

pub use datasource::{
    DataSourceConfig, DbConnection, Driver, DriverRegistry, PooledConnection, PooledDataSource,
};
pub use error::{JndiError, Result};
pub use manager::{DATA_SOURCE_CONTEXT, JndiManager};
pub use resources::{
    DefaultMailSessionFactory, MailSession, MailSessionFactory, ObjectFactory,
    ObjectFactoryRegistry,
};
pub use scheduler::{Scheduler, TaskHandle};
