//! Generic bounded-concurrency worker pool.
//!
//! The pool owns a bounded task queue and a fixed number of long-lived
//! workers that pull from it. It knows nothing about events: the dispatcher
//! plugs in a processor closure and submits [`QueuedMessage`](crate::QueuedMessage)s,
//! but any `Send` task type works.
//!
//! - At most `worker_count` tasks run at once.
//! - Tasks are taken in roughly FIFO order; with several workers active there
//!   is no strict ordering between completions.
//! - A failing (or panicking) task is recorded and the worker moves on.

use crate::error::{EventError, Result};
use crate::stats::{PoolStats, WorkerStats};
use crate::utils::current_timestamp_millis;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Function applied by a worker to each task.
pub type Processor<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Fixed-size pool of workers draining a shared bounded queue.
pub struct WorkerPool<T: Send + 'static> {
    name: String,
    worker_count: usize,
    queue_size: usize,
    /// `None` once the queue has been closed by `stop`
    sender: StdMutex<Option<mpsc::Sender<T>>>,
    receiver: Arc<Mutex<mpsc::Receiver<T>>>,
    processor: Processor<T>,
    token: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    worker_stats: Arc<RwLock<Vec<WorkerStats>>>,
    active: Arc<AtomicUsize>,
    started: AtomicBool,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Creates a pool. `worker_count` and `queue_size` must both be positive.
    pub fn new(
        name: impl Into<String>,
        worker_count: usize,
        queue_size: usize,
        processor: Processor<T>,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(EventError::InvalidConfig("worker_count must be > 0".into()));
        }
        if queue_size == 0 {
            return Err(EventError::InvalidConfig("queue_size must be > 0".into()));
        }
        let name = name.into();
        if queue_size < worker_count {
            warn!(
                "⚠️ Pool '{}' queue size {} is smaller than worker count {}",
                name, queue_size, worker_count
            );
        }

        let (tx, rx) = mpsc::channel(queue_size);
        let worker_stats = (0..worker_count)
            .map(|worker_id| WorkerStats { worker_id, ..Default::default() })
            .collect();

        Ok(Self {
            name,
            worker_count,
            queue_size,
            sender: StdMutex::new(Some(tx)),
            receiver: Arc::new(Mutex::new(rx)),
            processor,
            token: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            worker_stats: Arc::new(RwLock::new(worker_stats)),
            active: Arc::new(AtomicUsize::new(0)),
            started: AtomicBool::new(false),
        })
    }

    /// Convenience constructor taking an async closure as processor.
    pub fn with_fn<F, Fut>(
        name: impl Into<String>,
        worker_count: usize,
        queue_size: usize,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let processor: Processor<T> = Arc::new(move |task| f(task).boxed());
        Self::new(name, worker_count, queue_size, processor)
    }

    /// Launches exactly `worker_count` workers.
    ///
    /// Cancelling `ctx` stops the workers without draining the queue; use
    /// [`stop`](Self::stop) for an orderly shutdown. A second call is a no-op.
    pub async fn start(&self, ctx: &CancellationToken) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("⚠️ Pool '{}' already started", self.name);
            return;
        }

        let mut handles = self.handles.lock().await;
        for worker_id in 0..self.worker_count {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                self.receiver.clone(),
                self.processor.clone(),
                self.token.clone(),
                self.worker_stats.clone(),
                self.active.clone(),
            )));
        }

        let parent = ctx.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        info!("👷 Pool '{}' started {} workers (queue size {})", self.name, self.worker_count, self.queue_size);
    }

    async fn worker_loop(
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<T>>>,
        processor: Processor<T>,
        token: CancellationToken,
        worker_stats: Arc<RwLock<Vec<WorkerStats>>>,
        active: Arc<AtomicUsize>,
    ) {
        debug!("Worker {} started", worker_id);
        loop {
            let task = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    biased;
                    task = rx.recv() => task,
                    _ = token.cancelled() => None,
                }
            };
            let Some(task) = task else { break };

            active.fetch_add(1, Ordering::SeqCst);
            Self::set_active(&worker_stats, worker_id, true).await;

            let started = Instant::now();
            let outcome = match AssertUnwindSafe(processor(task)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(EventError::HandlerExecution(format!("worker {} task panicked", worker_id))),
            };
            let elapsed = started.elapsed();

            if let Err(e) = &outcome {
                debug!("Worker {} task failed after {:?}: {}", worker_id, elapsed, e);
            }

            {
                let mut stats = worker_stats.write().await;
                if let Some(worker) = stats.get_mut(worker_id) {
                    if outcome.is_ok() {
                        worker.processed += 1;
                    } else {
                        worker.failed += 1;
                    }
                    worker.total_time_us += elapsed.as_micros() as u64;
                    worker.active = false;
                    worker.last_activity = current_timestamp_millis();
                }
            }
            active.fetch_sub(1, Ordering::SeqCst);
        }
        debug!("Worker {} exiting", worker_id);
    }

    async fn set_active(worker_stats: &RwLock<Vec<WorkerStats>>, worker_id: usize, active: bool) {
        if let Some(worker) = worker_stats.write().await.get_mut(worker_id) {
            worker.active = active;
        }
    }

    fn current_sender(&self) -> Result<mpsc::Sender<T>> {
        if self.token.is_cancelled() {
            return Err(EventError::PoolStopped);
        }
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EventError::PoolStopped)
    }

    /// Non-blocking enqueue.
    pub fn submit(&self, task: T) -> Result<()> {
        let sender = self.current_sender()?;
        sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => EventError::QueueFull,
            TrySendError::Closed(_) => EventError::PoolStopped,
        })
    }

    /// Waits up to `timeout` for a free slot, then fails like [`submit`](Self::submit).
    pub async fn submit_with_timeout(&self, task: T, timeout: Duration) -> Result<()> {
        let sender = self.current_sender()?;
        sender.send_timeout(task, timeout).await.map_err(|e| match e {
            SendTimeoutError::Timeout(_) => EventError::QueueFull,
            SendTimeoutError::Closed(_) => EventError::PoolStopped,
        })
    }

    /// Waits as long as needed for a free slot. Fails only once the pool is stopped.
    pub async fn submit_wait(&self, task: T) -> Result<()> {
        let sender = self.current_sender()?;
        sender.send(task).await.map_err(|_| EventError::PoolStopped)
    }

    /// Closes the queue, lets the workers drain it and finish in-flight tasks,
    /// then cancels the shared context. Idempotent.
    pub async fn stop(&self) {
        let closed = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            info!("🛑 Stopping pool '{}'", self.name);
        }

        let handles = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!("❌ Pool '{}' worker ended abnormally: {}", self.name, e);
            }
        }
        self.token.cancel();
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_size
    }

    /// Tasks waiting in the queue.
    pub fn queue_depth(&self) -> usize {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.token.is_cancelled()
    }

    /// Snapshot of pool and per-worker counters.
    pub async fn stats(&self) -> PoolStats {
        PoolStats {
            worker_count: self.worker_count,
            queue_capacity: self.queue_size,
            queue_depth: self.queue_depth(),
            active_workers: self.active_workers(),
            workers: self.worker_stats.read().await.clone(),
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .field("queue_size", &self.queue_size)
            .field("running", &self.is_running())
            .finish()
    }
}
