//! Servlets shipped with the binary.

mod echo;
mod hello;
mod status;

pub use echo::Echo;
pub use hello::Hello;
pub use status::Status;

use crate::factory::{FactoryError, FactoryRegistry};
use crate::service::RouteConfig;
use crate::servlet::Servlet;

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn builtin_factories() -> Result<FactoryRegistry, FactoryError> {
    let mut factories = FactoryRegistry::new();
    factories.register_fn("hello", VERSION, || Box::new(Hello::new()) as Box<dyn Servlet>)?;
    factories.register_fn("echo", VERSION, || Box::new(Echo) as Box<dyn Servlet>)?;
    factories.register_fn("status", VERSION, || {
        Box::new(Status::default()) as Box<dyn Servlet>
    })?;
    Ok(factories)
}

/// Routes used when the configuration names none.
pub fn default_routes() -> Vec<RouteConfig> {
    ["hello", "echo", "status"]
        .into_iter()
        .map(|name| RouteConfig::new(name, name))
        .collect()
}
