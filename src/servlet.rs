use std::io;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::RequestContext;
use crate::properties::{Properties, PropertyError};

#[derive(Debug, Error)]
pub enum ServletError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Property(#[from] PropertyError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl ServletError {
    pub fn new(msg: impl Into<String>) -> ServletError {
        ServletError::Message(msg.into())
    }
}

/// A unit of request processing registered under a path prefix.
///
/// `init` runs once before the servlet becomes reachable and `destroy`
/// once after the last request against it has finished. `do_request`
/// is called concurrently from several workers, so implementations
/// guard their own mutable state.
#[async_trait]
pub trait Servlet: Send + Sync {
    async fn init(&mut self, config: &Properties) -> Result<(), ServletError> {
        let _ = config;
        Ok(())
    }

    /// Handle one request. The returned status is used for the response
    /// unless the servlet already flushed output.
    async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError>;

    async fn destroy(&self) -> Result<(), ServletError> {
        Ok(())
    }

    /// Free-form status for operator diagnostics.
    fn describe(&self) -> String {
        String::new()
    }
}
