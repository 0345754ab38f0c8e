//! Routing of accepted requests and execution of servlet calls.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;
use crate::registry::ServletRegistry;
use crate::servlet::{Servlet, ServletError};
use crate::transport::Exchange;
use crate::worker_pool::{panic_message, WorkerPool, WorkerPoolConfig};

const NOT_FOUND_BODY: &str = "Not Found\n";
const SERVER_ERROR_BODY: &str = "Internal Server Error\n";
const UNAVAILABLE_BODY: &str = "Service Unavailable\n";
const TIMEOUT_BODY: &str = "Gateway Timeout\n";

/// Three-digit codes, the only ones a CGI `Status:` line can carry.
const VALID_STATUS: std::ops::RangeInclusive<u16> = 100..=999;

/// A request paired with the servlet that serves it.
pub struct DispatchUnit {
    pub ctx: RequestContext,
    pub servlet: Arc<dyn Servlet>,
    pub prefix: String,
}

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    accepted: AtomicU64,
    dispatched: AtomicU64,
    completed: AtomicU64,
    not_found: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl DispatchMetrics {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Requests handed to the worker pool.
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Servlet calls that returned a status.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn not_found(&self) -> u64 {
        self.not_found.load(Ordering::Relaxed)
    }

    /// Requests refused because the pool no longer accepted work.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }
}

enum Outcome {
    Status(u16),
    Failed(ServletError),
    Panicked(String),
    TimedOut,
}

/// Run one servlet call to completion and end its response.
///
/// Servlet errors, panics and statuses outside 100..=999 become a 500,
/// an overrun of `timeout` a 504. When the servlet already sent its head
/// the status can no longer change; the response is then ended with a
/// non-zero application status instead.
pub async fn execute(unit: DispatchUnit, timeout: Option<Duration>, metrics: &DispatchMetrics) {
    let DispatchUnit {
        mut ctx,
        servlet,
        prefix,
    } = unit;
    let request_id = ctx.request_id();
    let started = Instant::now();

    let outcome = {
        let call = AssertUnwindSafe(servlet.do_request(&mut ctx)).catch_unwind();
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.ok(),
            None => Some(call.await),
        };
        match result {
            None => Outcome::TimedOut,
            Some(Ok(Ok(status))) => Outcome::Status(status),
            Some(Ok(Err(e))) => Outcome::Failed(e),
            Some(Err(panic)) => Outcome::Panicked(panic_message(panic.as_ref())),
        }
    };

    match outcome {
        Outcome::Status(status) if !VALID_STATUS.contains(&status) => {
            bump(&metrics.failed);
            error!(
                request_id,
                prefix = %prefix,
                path = ctx.path(),
                status,
                "servlet returned an invalid status"
            );
            respond_error(&mut ctx, 500, SERVER_ERROR_BODY).await;
        }
        Outcome::Status(status) => {
            bump(&metrics.completed);
            ctx.set_status(status);
            if let Err(e) = ctx.finish(0).await {
                warn!(request_id, prefix = %prefix, error = %e, "response aborted");
            }
        }
        Outcome::Failed(e) => {
            bump(&metrics.failed);
            error!(request_id, prefix = %prefix, path = ctx.path(), error = %e, "servlet failed");
            let _ = ctx.write_stderr(&format!("{}: {}\n", prefix, e)).await;
            respond_error(&mut ctx, 500, SERVER_ERROR_BODY).await;
        }
        Outcome::Panicked(message) => {
            bump(&metrics.panicked);
            error!(
                request_id,
                prefix = %prefix,
                path = ctx.path(),
                panic_message = %message,
                "servlet panicked"
            );
            respond_error(&mut ctx, 500, SERVER_ERROR_BODY).await;
        }
        Outcome::TimedOut => {
            bump(&metrics.timed_out);
            warn!(request_id, prefix = %prefix, path = ctx.path(), "servlet timed out");
            respond_error(&mut ctx, 504, TIMEOUT_BODY).await;
        }
    }
    debug!(
        request_id,
        prefix = %prefix,
        status = ctx.status(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request done"
    );
}

async fn respond_error(ctx: &mut RequestContext, status: u16, body: &str) {
    let result = if ctx.is_committed() {
        ctx.finish(1).await
    } else {
        ctx.send_fixed(status, body).await
    };
    if let Err(e) = result {
        warn!(request_id = ctx.request_id(), error = %e, "error response aborted");
    }
}

/// The fixed answer for a path no servlet is registered for.
pub async fn respond_not_found(mut ctx: RequestContext) {
    info!(
        request_id = ctx.request_id(),
        path = ctx.path(),
        "no servlet registered for path"
    );
    if let Err(e) = ctx.send_fixed(404, NOT_FOUND_BODY).await {
        warn!(request_id = ctx.request_id(), error = %e, "not-found response aborted");
    }
}

pub async fn respond_unavailable(mut ctx: RequestContext) {
    warn!(
        request_id = ctx.request_id(),
        path = ctx.path(),
        "worker pool closed, request refused"
    );
    if let Err(e) = ctx.send_fixed(503, UNAVAILABLE_BODY).await {
        warn!(request_id = ctx.request_id(), error = %e, "unavailable response aborted");
    }
}

/// Routes requests by path prefix onto a worker pool.
pub struct Dispatcher {
    registry: ServletRegistry,
    pool: WorkerPool<DispatchUnit>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(
        name: &str,
        registry: ServletRegistry,
        pool_config: &WorkerPoolConfig,
        timeout: Option<Duration>,
        metrics: Arc<DispatchMetrics>,
    ) -> Dispatcher {
        let pool = {
            let metrics = metrics.clone();
            WorkerPool::new(name, pool_config, move |unit: DispatchUnit| {
                let metrics = metrics.clone();
                async move { execute(unit, timeout, &metrics).await }
            })
        };
        Dispatcher {
            registry,
            pool,
            metrics,
        }
    }

    /// Route one accepted request. Waits while the worker queue is full.
    pub async fn dispatch(&self, request_id: u64, exchange: Exchange) {
        bump(&self.metrics.accepted);
        let ctx = RequestContext::new(request_id, exchange);
        let prefix = ctx.prefix().to_string();
        debug!(request_id, method = ctx.method(), path = ctx.path(), "request accepted");
        let Some(servlet) = self.registry.find(&prefix) else {
            bump(&self.metrics.not_found);
            respond_not_found(ctx).await;
            return;
        };
        let unit = DispatchUnit {
            ctx,
            servlet,
            prefix,
        };
        match self.pool.submit(unit).await {
            Ok(()) => bump(&self.metrics.dispatched),
            Err(rejected) => {
                bump(&self.metrics.rejected);
                respond_unavailable(rejected.0.ctx).await;
            }
        }
    }

    /// Stop taking work and wait for every queued request to finish.
    pub async fn drain(&self) {
        self.pool.drain_and_stop().await;
    }

    pub fn registry(&self) -> &ServletRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> ServletRegistry {
        self.registry
    }

    pub fn pool(&self) -> &WorkerPool<DispatchUnit> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{channel, MemoryRequest, MemoryResponse};
    use crate::transport::Listen;
    use async_trait::async_trait;

    struct Fixed(Result<u16, &'static str>);

    #[async_trait]
    impl Servlet for Fixed {
        async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
            ctx.write_str("partial").await?;
            self.0.map_err(ServletError::new)
        }
    }

    struct Streaming;

    #[async_trait]
    impl Servlet for Streaming {
        async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
            ctx.write_str("already sent").await?;
            ctx.flush().await?;
            Err(ServletError::new("late failure"))
        }
    }

    async fn serve_one(
        servlet: Arc<dyn Servlet>,
        request: MemoryRequest,
    ) -> MemoryResponse {
        let (client, listener) = channel(4);
        let mut transport = listener.listen().await.unwrap();
        let metrics = DispatchMetrics::default();
        let response = tokio::spawn(async move { client.send(request).await });
        let exchange = transport.accept().await.unwrap();
        let unit = DispatchUnit {
            ctx: RequestContext::new(1, exchange),
            servlet,
            prefix: "p".to_string(),
        };
        execute(unit, None, &metrics).await;
        response.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn returned_status_is_used() {
        let response = serve_one(Arc::new(Fixed(Ok(201))), MemoryRequest::get("/p")).await;
        assert_eq!(response.status, 201);
        assert_eq!(response.body_text(), "partial");
        assert_eq!(response.app_status, 0);
    }

    #[tokio::test]
    async fn invalid_status_becomes_server_error() {
        for status in [0, 99, 1000] {
            let response = serve_one(Arc::new(Fixed(Ok(status))), MemoryRequest::get("/p")).await;
            assert_eq!(response.status, 500, "servlet status {}", status);
            assert_eq!(response.body_text(), SERVER_ERROR_BODY);
        }
        let response = serve_one(Arc::new(Fixed(Ok(999))), MemoryRequest::get("/p")).await;
        assert_eq!(response.status, 999);
    }

    #[tokio::test]
    async fn error_replaces_buffered_output() {
        let response = serve_one(Arc::new(Fixed(Err("nope"))), MemoryRequest::get("/p")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.body_text(), SERVER_ERROR_BODY);
        assert_eq!(String::from_utf8_lossy(&response.stderr), "p: nope\n");
    }

    #[tokio::test]
    async fn error_after_commit_keeps_status() {
        let response = serve_one(Arc::new(Streaming), MemoryRequest::get("/p")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "already sent");
        assert_eq!(response.app_status, 1);
    }

    #[tokio::test]
    async fn unknown_prefix_is_not_found() {
        let (client, listener) = channel(4);
        let mut transport = listener.listen().await.unwrap();
        let metrics = Arc::new(DispatchMetrics::default());
        let dispatcher = Dispatcher::new(
            "test",
            ServletRegistry::new(),
            &WorkerPoolConfig::default(),
            None,
            metrics.clone(),
        );
        let response = tokio::spawn(async move { client.send(MemoryRequest::get("/nothing/here")).await });
        dispatcher.dispatch(1, transport.accept().await.unwrap()).await;
        let response = response.await.unwrap().unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body_text(), NOT_FOUND_BODY);
        assert_eq!(metrics.not_found(), 1);
        assert_eq!(metrics.dispatched(), 0);
        dispatcher.drain().await;
    }

    #[tokio::test]
    async fn closed_pool_answers_unavailable() {
        let (client, listener) = channel(4);
        let mut transport = listener.listen().await.unwrap();
        let metrics = Arc::new(DispatchMetrics::default());
        let mut registry = ServletRegistry::new();
        registry.register("p", Arc::new(Fixed(Ok(200))));
        let dispatcher = Dispatcher::new("test", registry, &WorkerPoolConfig::default(), None, metrics.clone());
        dispatcher.drain().await;
        let response = tokio::spawn(async move { client.send(MemoryRequest::get("/p")).await });
        dispatcher.dispatch(1, transport.accept().await.unwrap()).await;
        let response = response.await.unwrap().unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(metrics.rejected(), 1);
    }
}
