//! Factories for environment entries and mail sessions.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use winstone_naming::BoundObject;
use winstone_pool::BoxError;

use crate::error::{JndiError, Result};

/// Builds a bindable object from its single string form.
pub type ObjectFactory =
    Arc<dyn Fn(&str) -> std::result::Result<BoundObject, BoxError> + Send + Sync>;

/// Object factories keyed by declared class name.
///
/// Comes with the `java.lang` wrapper types; applications register their
/// own types with [`register`](Self::register).
pub struct ObjectFactoryRegistry {
    factories: RwLock<HashMap<String, ObjectFactory>>,
}

fn parsed<T>(value: &str) -> std::result::Result<BoundObject, BoxError>
where
    T: std::str::FromStr + Send + Sync + 'static,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    Ok(BoundObject::new(value.trim().parse::<T>()?))
}

impl Default for ObjectFactoryRegistry {
    fn default() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
        };
        registry.register("java.lang.String", |v| Ok(BoundObject::new(v.to_owned())));
        registry.register("java.lang.Integer", parsed::<i32>);
        registry.register("java.lang.Long", parsed::<i64>);
        registry.register("java.lang.Short", parsed::<i16>);
        registry.register("java.lang.Byte", parsed::<i8>);
        registry.register("java.lang.Boolean", |v| {
            // Anything but "true" is false, as Boolean.valueOf does.
            Ok(BoundObject::new(v.trim().eq_ignore_ascii_case("true")))
        });
        registry.register("java.lang.Double", parsed::<f64>);
        registry.register("java.lang.Float", parsed::<f32>);
        registry.register("java.lang.Character", |v| {
            let mut chars = v.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(BoundObject::new(c)),
                _ => Err(format!("expected a single character, got {v:?}").into()),
            }
        });
        registry
    }
}

impl ObjectFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `factory` for `class_name`, replacing any previous one.
    pub fn register<F>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> std::result::Result<BoundObject, BoxError> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(class_name.into(), Arc::new(factory));
    }

    /// Builds an instance of `class_name` from `value`.
    pub fn create(&self, class_name: &str, value: &str) -> Result<BoundObject> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(class_name)
            .cloned()
            .ok_or_else(|| JndiError::UnknownClassName(class_name.to_owned()))?;
        factory(value).map_err(|e| JndiError::construction(class_name, e))
    }

    pub fn contains(&self, class_name: &str) -> bool {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(class_name)
    }
}

impl fmt::Debug for ObjectFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let factories = self.factories.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = factories.keys().collect();
        names.sort();
        f.debug_struct("ObjectFactoryRegistry")
            .field("classes", &names)
            .finish()
    }
}

/// A mail session: the SMTP properties it was configured with.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MailSession {
    properties: HashMap<String, String>,
}

impl MailSession {
    pub fn new(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Builds mail-session objects from their properties.
pub trait MailSessionFactory: Send + Sync {
    fn create(&self, properties: &HashMap<String, String>)
    -> std::result::Result<BoundObject, BoxError>;
}

/// Produces a plain [`MailSession`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMailSessionFactory;

impl MailSessionFactory for DefaultMailSessionFactory {
    fn create(
        &self,
        properties: &HashMap<String, String>,
    ) -> std::result::Result<BoundObject, BoxError> {
        Ok(BoundObject::new(MailSession::new(properties.clone())))
    }
}
