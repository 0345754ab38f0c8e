#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use servlet_cgi::transport::memory::{channel, MemoryClient};
use servlet_cgi::worker_pool::WorkerPoolConfig;
use servlet_cgi::{
    FactoryRegistry, Properties, RequestContext, RouteConfig, Service, ServiceSettings, Servlet,
    ServletError,
};

/// What a servlet instance went through.
#[derive(Default)]
pub struct Probe {
    pub inits: AtomicUsize,
    pub requests: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub destroys: AtomicUsize,
    pub destroyed_while_busy: AtomicBool,
    pub paths: Mutex<Vec<String>>,
}

impl Probe {
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Request paths in the order the servlet started on them.
    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Reply,
    Fail,
    Panic,
    FailInit,
}

struct Busy<'a>(&'a AtomicUsize);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct ProbeServlet {
    probe: Arc<Probe>,
    body: String,
    delay: Duration,
    gate: Option<Arc<Semaphore>>,
    behaviour: Behaviour,
}

impl ProbeServlet {
    pub fn new(probe: &Arc<Probe>, body: &str) -> ProbeServlet {
        ProbeServlet {
            probe: probe.clone(),
            body: body.to_string(),
            delay: Duration::ZERO,
            gate: None,
            behaviour: Behaviour::Reply,
        }
    }

    pub fn delay(mut self, delay: Duration) -> ProbeServlet {
        self.delay = delay;
        self
    }

    /// Every request waits for one permit of `gate` before replying.
    pub fn gated(mut self, gate: &Arc<Semaphore>) -> ProbeServlet {
        self.gate = Some(gate.clone());
        self
    }

    pub fn behaviour(mut self, behaviour: Behaviour) -> ProbeServlet {
        self.behaviour = behaviour;
        self
    }
}

#[async_trait]
impl Servlet for ProbeServlet {
    async fn init(&mut self, config: &Properties) -> Result<(), ServletError> {
        self.probe.inits.fetch_add(1, Ordering::SeqCst);
        if let Some(body) = config.get("body") {
            self.body = body.to_string();
        }
        if self.behaviour == Behaviour::FailInit {
            return Err(ServletError::new("refusing to start"));
        }
        Ok(())
    }

    async fn do_request(&self, ctx: &mut RequestContext) -> Result<u16, ServletError> {
        self.probe.in_flight.fetch_add(1, Ordering::SeqCst);
        let _busy = Busy(&self.probe.in_flight);
        self.probe.paths.lock().unwrap().push(ctx.path().to_string());
        self.probe.requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.behaviour {
            Behaviour::Fail => Err(ServletError::new("servlet gave up")),
            Behaviour::Panic => panic!("servlet blew up"),
            Behaviour::Reply | Behaviour::FailInit => {
                ctx.write_str(&self.body).await?;
                Ok(200)
            }
        }
    }

    async fn destroy(&self) -> Result<(), ServletError> {
        if self.probe.in_flight() > 0 {
            self.probe.destroyed_while_busy.store(true, Ordering::SeqCst);
        }
        self.probe.destroys.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} requests", self.probe.requests())
    }
}

pub fn register(factories: &mut FactoryRegistry, name: &str, servlet: ProbeServlet) {
    factories
        .register_fn(name, "1.0", move || Box::new(servlet.clone()) as Box<dyn Servlet>)
        .unwrap();
}

pub fn routes(pairs: &[(&str, &str)]) -> Vec<RouteConfig> {
    pairs
        .iter()
        .map(|(prefix, factory)| RouteConfig::new(*prefix, *factory))
        .collect()
}

pub fn settings(num_workers: usize) -> ServiceSettings {
    ServiceSettings {
        name: "test-service".to_string(),
        pool: WorkerPoolConfig {
            num_workers,
            queue_bound: 8,
        },
        ..ServiceSettings::default()
    }
}

/// Poll `done` until it holds; panics after two seconds.
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn start(
    settings: ServiceSettings,
    factories: FactoryRegistry,
    routes: Vec<RouteConfig>,
) -> (Service, MemoryClient) {
    let (client, listener) = channel(16);
    let mut service = Service::new(settings, factories, routes, Box::new(listener));
    service.start().await.unwrap();
    (service, client)
}
