//! Fixed set of worker tasks pulling jobs from one bounded queue.
//!
//! `submit` waits while the queue is full, so a slow pool pushes back on
//! whoever feeds it instead of buffering without limit. A job that panics
//! is caught at the worker boundary; the worker logs it and moves on to
//! the next job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::FutureExt;
use serde::Deserialize;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    /// Jobs waiting for a worker before `submit` blocks.
    pub queue_bound: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        WorkerPoolConfig {
            num_workers: 4,
            queue_bound: 64,
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkerPoolMetrics {
    dispatched: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl WorkerPoolMetrics {
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn panicked(&self) -> u64 {
        self.panicked.load(Ordering::Relaxed)
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> u64 {
        self.dispatched()
            .saturating_sub(self.completed() + self.panicked())
    }
}

pub struct WorkerPool<T> {
    name: String,
    sender: StdMutex<Option<mpsc::Sender<T>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    metrics: Arc<WorkerPoolMetrics>,
}

impl<T> WorkerPool<T>
where
    T: Send + 'static,
{
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn new<F, Fut>(name: impl Into<String>, config: &WorkerPoolConfig, work: F) -> WorkerPool<T>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let num_workers = config.num_workers.max(1);
        let (tx, rx) = mpsc::channel(config.queue_bound.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let work = Arc::new(work);
        let metrics = Arc::new(WorkerPoolMetrics::default());

        info!(
            pool = %name,
            num_workers,
            queue_bound = config.queue_bound,
            "creating worker pool"
        );

        let workers = (0..num_workers)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    name.clone(),
                    worker_id,
                    rx.clone(),
                    work.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        WorkerPool {
            name,
            sender: StdMutex::new(Some(tx)),
            workers: StdMutex::new(workers),
            metrics,
        }
    }

    /// Queue a job, waiting for room if the queue is full. The job is
    /// handed back once the pool has stopped accepting work.
    pub async fn submit(&self, job: T) -> Result<(), SendError<T>> {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sender) = sender else {
            return Err(SendError(job));
        };
        sender.send(job).await?;
        self.metrics.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.sender.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// Stop accepting jobs and wait until every queued and running job
    /// has finished. Later calls return at once.
    pub async fn drain_and_stop(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => Vec::new(),
        };
        if workers.is_empty() {
            return;
        }
        debug!(pool = %self.name, "draining worker pool");
        for worker in workers {
            if let Err(e) = worker.await {
                error!(pool = %self.name, error = %e, "worker task failed");
            }
        }
        info!(
            pool = %self.name,
            completed = self.metrics.completed(),
            panicked = self.metrics.panicked(),
            "worker pool stopped"
        );
    }

    pub fn metrics(&self) -> &Arc<WorkerPoolMetrics> {
        &self.metrics
    }
}

async fn run_worker<T, F, Fut>(
    name: String,
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<T>>>,
    work: Arc<F>,
    metrics: Arc<WorkerPoolMetrics>,
) where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    debug!(pool = %name, worker_id, "worker started");
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        // Calling `work` inside the async block puts a panic in the call
        // itself under catch_unwind too.
        let outcome = AssertUnwindSafe(async { work(job).await })
            .catch_unwind()
            .await;
        match outcome {
            Ok(()) => {
                metrics.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(panic) => {
                metrics.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    pool = %name,
                    worker_id,
                    panic_message = %panic_message(panic.as_ref()),
                    "job panicked"
                );
            }
        }
    }
    debug!(pool = %name, worker_id, "worker exiting");
}

/// Text of a panic payload, when it carries one.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
