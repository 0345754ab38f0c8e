//! Service lifecycle: opens the transport, builds the servlet registry,
//! runs the accept loop and shuts everything down in order.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::FutureExt;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchMetrics, Dispatcher};
use crate::factory::FactoryRegistry;
use crate::properties::Properties;
use crate::registry::ServletRegistry;
use crate::servlet::Servlet;
use crate::transport::{Listen, Transport, TransportError};
use crate::worker_pool::{panic_message, WorkerPoolConfig};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ServiceStatus {
    Init = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl ServiceStatus {
    fn from_u8(value: u8) -> ServiceStatus {
        match value {
            0 => ServiceStatus::Init,
            1 => ServiceStatus::Running,
            2 => ServiceStatus::Stopping,
            _ => ServiceStatus::Stopped,
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceStatus::Init => "INIT",
            ServiceStatus::Running => "RUNNING",
            ServiceStatus::Stopping => "STOPPING",
            ServiceStatus::Stopped => "STOPPED",
        })
    }
}

/// Read-only view of a service's status, usable from any thread.
#[derive(Debug, Clone)]
pub struct StatusHandle(Arc<AtomicU8>);

impl StatusHandle {
    fn new() -> StatusHandle {
        StatusHandle(Arc::new(AtomicU8::new(ServiceStatus::Init as u8)))
    }

    pub fn get(&self) -> ServiceStatus {
        ServiceStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, status: ServiceStatus) {
        self.0.store(status as u8, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service cannot be started in state {0}")]
    AlreadyStarted(ServiceStatus),
    #[error(transparent)]
    Listen(#[from] TransportError),
}

/// One configured route: the servlet a factory creates for a prefix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConfig {
    pub prefix: String,
    pub factory: String,
    #[serde(default)]
    pub properties: Properties,
}

impl RouteConfig {
    pub fn new(prefix: impl Into<String>, factory: impl Into<String>) -> RouteConfig {
        RouteConfig {
            prefix: prefix.into(),
            factory: factory.into(),
            properties: Properties::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> RouteConfig {
        self.properties.set(name, value);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub name: String,
    pub version: String,
    pub pool: WorkerPoolConfig,
    /// Limit for a single `do_request` call; `None` lets it run forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        ServiceSettings {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pool: WorkerPoolConfig::default(),
            request_timeout: None,
        }
    }
}

struct Running {
    dispatcher: Arc<Dispatcher>,
    accept_task: JoinHandle<()>,
}

pub struct Service {
    settings: ServiceSettings,
    factories: FactoryRegistry,
    routes: Vec<RouteConfig>,
    listener: Box<dyn Listen>,
    status: StatusHandle,
    stop_signal: watch::Sender<bool>,
    metrics: Arc<DispatchMetrics>,
    started_at: Option<SystemTime>,
    local_addr: Option<String>,
    running: Option<Running>,
}

impl Service {
    pub fn new(
        settings: ServiceSettings,
        factories: FactoryRegistry,
        routes: Vec<RouteConfig>,
        listener: Box<dyn Listen>,
    ) -> Service {
        let (stop_signal, _) = watch::channel(false);
        Service {
            settings,
            factories,
            routes,
            listener,
            status: StatusHandle::new(),
            stop_signal,
            metrics: Arc::new(DispatchMetrics::default()),
            started_at: None,
            local_addr: None,
            running: None,
        }
    }

    /// Open the transport, build the registry and start accepting.
    ///
    /// Only a failure to open the transport is an error; the service then
    /// stays in `Init`. Routes whose factory is unknown or whose servlet
    /// fails to initialise are logged and skipped.
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        let status = self.status.get();
        if status != ServiceStatus::Init {
            return Err(ServiceError::AlreadyStarted(status));
        }

        let transport = match self.listener.listen().await {
            Ok(transport) => transport,
            Err(e) => {
                error!(service = %self.settings.name, error = %e, "cannot open transport");
                return Err(e.into());
            }
        };
        self.local_addr = transport.local_addr();

        for factory in self.factories.iter() {
            info!(
                factory = factory.name(),
                version = factory.version(),
                "servlet factory loaded"
            );
        }
        let registry = self.build_registry().await;

        let dispatcher = Arc::new(Dispatcher::new(
            &self.settings.name,
            registry,
            &self.settings.pool,
            self.settings.request_timeout,
            self.metrics.clone(),
        ));

        // The Rust runtime ignores SIGPIPE, so a peer that hangs up only
        // surfaces as a BrokenPipe error on its own response.
        self.status.set(ServiceStatus::Running);
        self.started_at = Some(SystemTime::now());
        self.stop_signal.send_replace(false);
        let accept_task = tokio::spawn(accept_loop(
            transport,
            dispatcher.clone(),
            self.stop_signal.subscribe(),
        ));
        self.running = Some(Running {
            dispatcher,
            accept_task,
        });
        info!(
            service = %self.settings.name,
            version = %self.settings.version,
            address = ?self.local_addr,
            "service running"
        );
        Ok(())
    }

    async fn build_registry(&self) -> ServletRegistry {
        let mut registry = ServletRegistry::new();
        for route in &self.routes {
            let prefix = route.prefix.trim_matches('/');
            let Some(factory) = self.factories.find(&route.factory) else {
                error!(prefix, factory = %route.factory, "unknown servlet factory, route skipped");
                continue;
            };
            let mut servlet = factory.create();
            if let Err(e) = servlet.init(&route.properties).await {
                error!(prefix, factory = %route.factory, error = %e, "servlet init failed, route skipped");
                continue;
            }
            let servlet: Arc<dyn Servlet> = Arc::from(servlet);
            if !registry.register(prefix, servlet.clone()) {
                error!(prefix, factory = %route.factory, "prefix already registered, route skipped");
                destroy(prefix, servlet).await;
                continue;
            }
            info!(
                prefix,
                factory = factory.name(),
                version = factory.version(),
                "servlet registered"
            );
        }
        registry
    }

    /// Stop accepting, let queued requests finish, then destroy every
    /// servlet. Repeated calls do nothing.
    pub async fn stop(&mut self) {
        match self.status.get() {
            ServiceStatus::Init => {
                self.status.set(ServiceStatus::Stopped);
                info!(service = %self.settings.name, "service stopped before start");
                return;
            }
            ServiceStatus::Stopping | ServiceStatus::Stopped => return,
            ServiceStatus::Running => {}
        }
        self.status.set(ServiceStatus::Stopping);
        info!(service = %self.settings.name, "service stopping");
        self.stop_signal.send_replace(true);

        if let Some(running) = self.running.take() {
            if let Err(e) = running.accept_task.await {
                error!(error = %e, "accept loop failed");
            }
            running.dispatcher.drain().await;
            let servlets = match Arc::try_unwrap(running.dispatcher) {
                Ok(dispatcher) => dispatcher.into_registry().drain(),
                Err(shared) => shared.registry().entries(),
            };
            for (prefix, servlet) in servlets {
                destroy(&prefix, servlet).await;
            }
        }

        self.status.set(ServiceStatus::Stopped);
        info!(
            service = %self.settings.name,
            accepted = self.metrics.accepted(),
            "service stopped"
        );
    }

    pub fn get_status(&self) -> ServiceStatus {
        self.status.get()
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.clone()
    }

    pub fn get_service_name(&self) -> &str {
        &self.settings.name
    }

    pub fn get_service_version(&self) -> &str {
        &self.settings.version
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.started_at
    }

    /// Address the transport listens on, once started.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// `(prefix, describe())` for every registered servlet, sorted by
    /// prefix. Empty unless running.
    pub fn describe_servlets(&self) -> Vec<(String, String)> {
        match &self.running {
            Some(running) => running
                .dispatcher
                .registry()
                .entries()
                .into_iter()
                .map(|(prefix, servlet)| (prefix, servlet.describe()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop_signal.send_replace(true);
    }
}

async fn destroy(prefix: &str, servlet: Arc<dyn Servlet>) {
    match AssertUnwindSafe(servlet.destroy()).catch_unwind().await {
        Ok(Ok(())) => debug!(prefix, "servlet destroyed"),
        Ok(Err(e)) => warn!(prefix, error = %e, "servlet destroy failed"),
        Err(panic) => error!(
            prefix,
            panic_message = %panic_message(panic.as_ref()),
            "servlet destroy panicked"
        ),
    }
}

async fn accept_loop(
    mut transport: Box<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    mut stop: watch::Receiver<bool>,
) {
    let mut next_request_id: u64 = 0;
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let accepted = tokio::select! {
            biased;
            changed = stop.changed() => match changed {
                Ok(()) => continue,
                Err(_) => break,
            },
            accepted = transport.accept() => accepted,
        };
        match accepted {
            Ok(exchange) => {
                next_request_id += 1;
                dispatcher.dispatch(next_request_id, exchange).await;
            }
            Err(TransportError::Closed) => {
                info!("transport closed, waiting for stop");
                let _ = stop.wait_for(|stopped| *stopped).await;
                break;
            }
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::select! {
                    biased;
                    _ = stop.changed() => {}
                    _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                }
            }
        }
    }
    debug!("accept loop stopped");
}
