pub mod fast_cgi {
    pub mod records;
    pub mod input_stream;
    pub mod record_output;
    pub mod decode;
    pub mod encode;
    pub mod request;
    pub mod transport;
    pub mod defs;
}

pub mod transport;
pub mod context;
pub mod properties;
pub mod servlet;
pub mod factory;
pub mod registry;
pub mod worker_pool;
pub mod dispatcher;
pub mod service;
pub mod config;
pub mod servlets;

pub use context::RequestContext;
pub use factory::{FactoryRegistry, ServletFactory};
pub use properties::Properties;
pub use service::{RouteConfig, Service, ServiceSettings, ServiceStatus};
pub use servlet::{Servlet, ServletError};
