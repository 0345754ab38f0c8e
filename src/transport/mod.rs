//! Boundary between the dispatcher and whatever carries requests to it.
//!
//! A [`Listen`] opens the endpoint, the resulting [`Transport`] yields one
//! [`Exchange`] per inbound request. An exchange describes the request with
//! CGI meta-variables, carries the request body as a reader, and owns the
//! [`ResponseSink`] the response is written to.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

pub mod memory;

/// CGI meta-variables (`REQUEST_METHOD`, `QUERY_STRING`, `HTTP_*`, ...).
pub type CgiParams = BTreeMap<String, String>;

pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("transport closed")]
    Closed,
    #[error("no response was produced")]
    NoResponse,
}

/// Where the response of one request goes.
#[async_trait]
pub trait ResponseSink: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    async fn flush(&mut self) -> io::Result<()>;

    /// Diagnostic output for the web server's error log.
    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        let _ = data;
        Ok(())
    }

    /// End the response. Nothing may be written afterwards.
    async fn finish(&mut self, app_status: u32) -> io::Result<()>;
}

/// One inbound request together with its response channel.
pub struct Exchange {
    pub params: CgiParams,
    pub body: BodyReader,
    pub sink: Box<dyn ResponseSink>,
}

#[async_trait]
pub trait Transport: Send {
    /// Wait for the next request. `TransportError::Closed` is final,
    /// any other error is recoverable.
    async fn accept(&mut self) -> Result<Exchange, TransportError>;

    fn local_addr(&self) -> Option<String> {
        None
    }
}

/// Opens a listening transport.
#[async_trait]
pub trait Listen: Send + Sync {
    async fn listen(&self) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Debug, Error)]
#[error("invalid listen address {0:?}, expected host:port, unix:/path or stdin")]
pub struct ListenAddressError(String);

/// Listening endpoint of the FastCGI transport.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub enum ListenAddress {
    Tcp(String),
    Unix(PathBuf),
    /// The listening socket the web server passes on file descriptor 0.
    Inherited,
}

impl FromStr for ListenAddress {
    type Err = ListenAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "stdin" || s == "fd:0" {
            Ok(ListenAddress::Inherited)
        } else if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ListenAddressError(s.to_string()));
            }
            Ok(ListenAddress::Unix(PathBuf::from(path)))
        } else if s.rsplit_once(':').is_some_and(|(host, port)| {
            !host.is_empty() && port.parse::<u16>().is_ok()
        }) {
            Ok(ListenAddress::Tcp(s.to_string()))
        } else {
            Err(ListenAddressError(s.to_string()))
        }
    }
}

impl TryFrom<String> for ListenAddress {
    type Error = ListenAddressError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Tcp(addr) => f.write_str(addr),
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddress::Inherited => f.write_str("stdin"),
        }
    }
}
