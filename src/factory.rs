use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::servlet::Servlet;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FactoryError {
    #[error("servlet factory {0:?} is already registered")]
    Duplicate(String),
}

/// Creates servlet instances; resolved by name when routes are built.
pub trait ServletFactory: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str;

    /// A fresh instance, one per configured prefix.
    fn create(&self) -> Box<dyn Servlet>;
}

/// Factory backed by a closure.
pub struct FnFactory<F> {
    name: String,
    version: String,
    create: F,
}

impl<F> FnFactory<F>
where
    F: Fn() -> Box<dyn Servlet> + Send + Sync,
{
    pub fn new(name: impl Into<String>, version: impl Into<String>, create: F) -> FnFactory<F> {
        FnFactory {
            name: name.into(),
            version: version.into(),
            create,
        }
    }
}

impl<F> ServletFactory for FnFactory<F>
where
    F: Fn() -> Box<dyn Servlet> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn create(&self) -> Box<dyn Servlet> {
        (self.create)()
    }
}

/// Append-only list of servlet factories, kept in registration order.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: Vec<Arc<dyn ServletFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> FactoryRegistry {
        FactoryRegistry::default()
    }

    pub fn register<T>(&mut self, factory: T) -> Result<(), FactoryError>
    where
        T: ServletFactory + 'static,
    {
        if self.find(factory.name()).is_some() {
            return Err(FactoryError::Duplicate(factory.name().to_string()));
        }
        self.factories.push(Arc::new(factory));
        Ok(())
    }

    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        create: F,
    ) -> Result<(), FactoryError>
    where
        F: Fn() -> Box<dyn Servlet> + Send + Sync + 'static,
    {
        self.register(FnFactory::new(name, version, create))
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn ServletFactory>> {
        self.factories.iter().find(|f| f.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ServletFactory>> {
        self.factories.iter()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|x| (x.name(), x.version())))
            .finish()
    }
}
