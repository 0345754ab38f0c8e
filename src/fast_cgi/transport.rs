use std::io;
use std::os::unix::io::FromRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::defs;
use super::input_stream::RecordInputStream;
use super::record_output::RecordOutput;
use super::records::{AppRecord, EndRequest};
use super::request::{read_request, ConnectionLimits};
use crate::transport::{Exchange, Listen, ListenAddress, ResponseSink, Transport, TransportError};

trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

enum Acceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Acceptor {
    async fn accept(&self) -> io::Result<Box<dyn Connection>> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "accepted FastCGI connection");
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("accepted FastCGI connection");
                Ok(Box::new(stream))
            }
        }
    }
}

async fn open(address: &ListenAddress, backlog: u32) -> io::Result<(Acceptor, Option<String>)> {
    match address {
        ListenAddress::Tcp(addr) => {
            let addr = tokio::net::lookup_host(addr.as_str())
                .await?
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"))?;
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            socket.bind(addr)?;
            let listener = socket.listen(backlog)?;
            let local = listener.local_addr()?.to_string();
            Ok((Acceptor::Tcp(listener), Some(local)))
        }
        ListenAddress::Unix(path) => {
            let listener = UnixListener::bind(path)?;
            Ok((Acceptor::Unix(listener), Some(address.to_string())))
        }
        ListenAddress::Inherited => {
            // SAFETY: the web server hands FastCGI applications their
            // listening socket as file descriptor 0 and nothing else in
            // this process owns it.
            let std_listener =
                unsafe { std::os::unix::net::UnixListener::from_raw_fd(defs::FCGI_LISTENSOCK_FILENO) };
            std_listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(std_listener)?;
            Ok((Acceptor::Unix(listener), None))
        }
    }
}

/// Opens FastCGI listening sockets.
#[derive(Debug, Clone)]
pub struct FcgiListener {
    pub address: ListenAddress,
    pub backlog: u32,
    pub max_connections: usize,
}

#[async_trait]
impl Listen for FcgiListener {
    async fn listen(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = FcgiTransport::bind(&self.address, self.backlog, self.max_connections).await?;
        Ok(Box::new(transport))
    }
}

/// FastCGI responder transport.
///
/// Connections are accepted and decoded on background tasks; every
/// completed request is queued as an [`Exchange`] for `accept()`.
pub struct FcgiTransport {
    exchanges: mpsc::Receiver<Result<Exchange, TransportError>>,
    acceptor: JoinHandle<()>,
    local_addr: Option<String>,
}

impl FcgiTransport {
    pub async fn bind(
        address: &ListenAddress,
        backlog: u32,
        max_connections: usize,
    ) -> Result<FcgiTransport, TransportError> {
        let (acceptor, local_addr) =
            open(address, backlog)
                .await
                .map_err(|source| TransportError::Bind {
                    address: address.to_string(),
                    source,
                })?;
        info!(address = %address, local = ?local_addr, "FastCGI transport listening");
        let max_connections = max_connections.max(1);
        let limits = ConnectionLimits {
            max_conns: max_connections,
            max_reqs: max_connections,
        };
        let (tx, exchanges) = mpsc::channel(backlog.max(1) as usize);
        let permits = Arc::new(Semaphore::new(max_connections));
        let acceptor = tokio::spawn(accept_connections(acceptor, tx, permits, limits));
        Ok(FcgiTransport {
            exchanges,
            acceptor,
            local_addr,
        })
    }
}

impl Drop for FcgiTransport {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

#[async_trait]
impl Transport for FcgiTransport {
    async fn accept(&mut self) -> Result<Exchange, TransportError> {
        match self.exchanges.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    fn local_addr(&self) -> Option<String> {
        self.local_addr.clone()
    }
}

async fn accept_connections(
    acceptor: Acceptor,
    tx: mpsc::Sender<Result<Exchange, TransportError>>,
    permits: Arc<Semaphore>,
    limits: ConnectionLimits,
) {
    loop {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let accepted = tokio::select! {
            _ = tx.closed() => break,
            accepted = acceptor.accept() => accepted,
        };
        match accepted {
            Ok(stream) => {
                tokio::spawn(serve_connection(stream, tx.clone(), permit, limits));
            }
            Err(e) => {
                if tx.send(Err(TransportError::Accept(e))).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("FastCGI acceptor stopped");
}

async fn serve_connection(
    stream: Box<dyn Connection>,
    tx: mpsc::Sender<Result<Exchange, TransportError>>,
    permit: OwnedSemaphorePermit,
    limits: ConnectionLimits,
) {
    let mut input = RecordInputStream::new(stream);
    match read_request(&mut input, &limits).await {
        Ok(Some(req)) => {
            if req.keep_conn {
                debug!(request_id = req.request_id, "FCGI_KEEP_CONN ignored, closing after response");
            }
            let exchange = Exchange {
                params: req.params,
                body: Box::new(io::Cursor::new(req.stdin.freeze())),
                sink: Box::new(FcgiResponseSink {
                    output: RecordOutput::new(input.into_inner()),
                    request_id: req.request_id,
                    finished: false,
                    _permit: permit,
                }),
            };
            if tx.send(Ok(exchange)).await.is_err() {
                debug!("transport closed, dropping request");
            }
        }
        Ok(None) => debug!("connection closed before a request completed"),
        Err(e) => warn!(error = %e, "dropping FastCGI connection"),
    }
}

/// Writes the response of one request as STDOUT records followed by
/// END_REQUEST, then closes the connection.
pub struct FcgiResponseSink<S> {
    output: RecordOutput<S>,
    request_id: u16,
    finished: bool,
    _permit: OwnedSemaphorePermit,
}

impl<S> FcgiResponseSink<S> {
    fn check(&self) -> io::Result<()> {
        if self.finished {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "response already finished",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> ResponseSink for FcgiResponseSink<S>
where
    S: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        // An empty STDOUT record would end the stream
        if data.is_empty() {
            return Ok(());
        }
        Ok(self.output.write_stream(false, data, self.request_id).await?)
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        Ok(self.output.flush().await?)
    }

    async fn write_stderr(&mut self, data: &[u8]) -> io::Result<()> {
        self.check()?;
        if data.is_empty() {
            return Ok(());
        }
        Ok(self.output.write_stream(true, data, self.request_id).await?)
    }

    async fn finish(&mut self, app_status: u32) -> io::Result<()> {
        self.check()?;
        self.finished = true;
        self.output
            .write_app(&AppRecord::StdOut(Bytes::new()), self.request_id)
            .await?;
        let end = AppRecord::EndRequest(EndRequest {
            app_status,
            protocol_status: defs::FCGI_REQUEST_COMPLETE,
        });
        self.output.write_app(&end, self.request_id).await?;
        self.output.flush().await?;
        self.output.shutdown().await?;
        Ok(())
    }
}
