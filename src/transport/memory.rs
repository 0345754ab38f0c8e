//! In-process transport. Requests are handed over a channel and the CGI
//! response written by the service is parsed back into a
//! [`MemoryResponse`]. Used by the integration tests and by hosts that
//! embed the dispatcher without a web server in front of it.

use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{CgiParams, Exchange, Listen, ResponseSink, Transport, TransportError};

/// A request as a client would issue it.
#[derive(Debug, Clone)]
pub struct MemoryRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    broken_pipe: bool,
}

impl MemoryRequest {
    pub fn new(method: &str, uri: &str) -> MemoryRequest {
        MemoryRequest {
            method: method.to_string(),
            uri: uri.to_string(),
            headers: Vec::new(),
            body: Vec::new(),
            broken_pipe: false,
        }
    }

    pub fn get(uri: &str) -> MemoryRequest {
        MemoryRequest::new("GET", uri)
    }

    pub fn post_form(uri: &str, body: &str) -> MemoryRequest {
        MemoryRequest::new("POST", uri)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(body.as_bytes().to_vec())
    }

    pub fn header(mut self, name: &str, value: &str) -> MemoryRequest {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> MemoryRequest {
        self.body = body;
        self
    }

    /// Every write of the response fails as if the peer had gone away.
    pub fn broken_pipe(mut self) -> MemoryRequest {
        self.broken_pipe = true;
        self
    }

    fn to_params(&self) -> CgiParams {
        let mut params = CgiParams::new();
        let (path, query) = match self.uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (self.uri.as_str(), ""),
        };
        params.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
        params.insert("SERVER_PROTOCOL".into(), "HTTP/1.1".into());
        params.insert("REQUEST_METHOD".into(), self.method.clone());
        params.insert("REQUEST_URI".into(), self.uri.clone());
        params.insert("DOCUMENT_URI".into(), path.to_string());
        params.insert("QUERY_STRING".into(), query.to_string());
        params.insert("CONTENT_LENGTH".into(), self.body.len().to_string());
        for (name, value) in &self.headers {
            let key = name.to_ascii_uppercase().replace('-', "_");
            let key = match key.as_str() {
                "CONTENT_TYPE" | "CONTENT_LENGTH" => key,
                _ => format!("HTTP_{}", key),
            };
            params.insert(key, value.clone());
        }
        params
    }
}

/// Response as parsed from the CGI output of the service.
#[derive(Debug, Clone, Default)]
pub struct MemoryResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
}

impl MemoryResponse {
    fn parse(output: &[u8], stderr: Vec<u8>, app_status: u32) -> MemoryResponse {
        let (head, body) = match output.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => (&output[..pos], &output[pos + 4..]),
            None => (output, &[][..]),
        };
        let mut status = 200;
        let mut headers = Vec::new();
        for line in String::from_utf8_lossy(head).split("\r\n") {
            if let Some((name, value)) = line.split_once(':') {
                let value = value.trim();
                if name.eq_ignore_ascii_case("Status") {
                    status = value
                        .split_whitespace()
                        .next()
                        .and_then(|code| code.parse().ok())
                        .unwrap_or(status);
                } else {
                    headers.push((name.to_string(), value.to_string()));
                }
            }
        }
        MemoryResponse {
            status,
            headers,
            body: body.to_vec(),
            stderr,
            app_status,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct MemorySink {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    broken_pipe: bool,
    reply: Option<oneshot::Sender<MemoryResponse>>,
}

impl MemorySink {
    fn check(&self) -> io::Result<()> {
        if self.broken_pipe {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer went away"));
        }
        if self.reply.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response already finished",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseSink for MemorySink {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        self.stdout.extend_from_slice(data);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.check()
    }

    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        self.stderr.extend_from_slice(data);
        Ok(())
    }

    async fn finish(&mut self, app_status: u32) -> io::Result<()> {
        self.check()?;
        if let Some(reply) = self.reply.take() {
            let response =
                MemoryResponse::parse(&self.stdout, std::mem::take(&mut self.stderr), app_status);
            // The client may have given up waiting
            let _ = reply.send(response);
        }
        Ok(())
    }
}

/// Client side of a memory transport.
#[derive(Clone)]
pub struct MemoryClient {
    requests: mpsc::Sender<Exchange>,
}

impl MemoryClient {
    /// Issue a request and wait for the complete response.
    pub async fn send(&self, request: MemoryRequest) -> Result<MemoryResponse, TransportError> {
        self.submit(request).await?.wait().await
    }

    /// Queue a request without waiting for its response. Requests are
    /// accepted in the order they were submitted.
    pub async fn submit(&self, request: MemoryRequest) -> Result<PendingResponse, TransportError> {
        let (reply, response) = oneshot::channel();
        let exchange = Exchange {
            params: request.to_params(),
            body: Box::new(io::Cursor::new(request.body)),
            sink: Box::new(MemorySink {
                stdout: Vec::new(),
                stderr: Vec::new(),
                broken_pipe: request.broken_pipe,
                reply: Some(reply),
            }),
        };
        self.requests
            .send(exchange)
            .await
            .map_err(|_| TransportError::Closed)?;
        Ok(PendingResponse(response))
    }
}

/// A submitted request whose response has not been read yet.
pub struct PendingResponse(oneshot::Receiver<MemoryResponse>);

impl PendingResponse {
    pub async fn wait(self) -> Result<MemoryResponse, TransportError> {
        self.0.await.map_err(|_| TransportError::NoResponse)
    }
}

/// Server side of a memory transport; can be listened on once.
pub struct MemoryListener {
    incoming: Mutex<Option<mpsc::Receiver<Exchange>>>,
}

struct MemoryTransport {
    incoming: mpsc::Receiver<Exchange>,
}

/// Create a connected client/listener pair.
pub fn channel(capacity: usize) -> (MemoryClient, MemoryListener) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        MemoryClient { requests: tx },
        MemoryListener {
            incoming: Mutex::new(Some(rx)),
        },
    )
}

#[async_trait]
impl Listen for MemoryListener {
    async fn listen(&self) -> Result<Box<dyn Transport>, TransportError> {
        let incoming = self
            .incoming
            .lock()
            .map_err(|_| TransportError::Closed)?
            .take()
            .ok_or_else(|| TransportError::Bind {
                address: "memory".to_string(),
                source: io::Error::new(io::ErrorKind::AddrInUse, "memory listener already in use"),
            })?;
        Ok(Box::new(MemoryTransport { incoming }))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn accept(&mut self) -> Result<Exchange, TransportError> {
        self.incoming.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> Option<String> {
        Some("memory".to_string())
    }
}
