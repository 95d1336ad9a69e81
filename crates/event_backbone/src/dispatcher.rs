//! Queue-backed event dispatcher.
//!
//! The dispatcher is the entry point producers use. It offers three paths:
//!
//! - [`dispatch`](EventDispatcher::dispatch): runs the event through the
//!   middleware chain and delivers it right away, returning the outcome.
//! - [`dispatch_async`](EventDispatcher::dispatch_async): enqueues the event
//!   on a bounded queue and returns immediately; `QueueFull` is the caller's
//!   backpressure signal.
//! - [`dispatch_batch`](EventDispatcher::dispatch_batch): delivers a group of
//!   events through the chain, then flushes the broker copies in one batch.
//!
//! Queued messages flow through three background loops tied to the
//! dispatcher's lifetime:
//!
//! ```text
//! queue ──drain loop──▶ batcher ──(size or timer)──▶ worker pool ──▶ middleware ──▶ bus / broker
//!   ▲                                                     │
//!   └──────────── retry after retry_delay × retry_count ──┘ (failure)
//! ```
//!
//! plus a metrics loop that logs a stats summary periodically. A message that
//! fails `max_retries + 1` times is dead-lettered (or dropped when
//! dead-lettering is disabled).

use crate::broker::BrokerPublisher;
use crate::bus::EventBus;
use crate::config::DispatcherConfig;
use crate::envelope::{DeadLetterRecord, EventEnvelope, QueuedMessage};
use crate::error::{BatchFailure, EventError, Result};
use crate::handler::EventHandler;
use crate::middleware::{Endpoint, MiddlewareChain};
use crate::pool::WorkerPool;
use crate::stats::{DispatcherStats, EventTypeStats};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Innermost step of the middleware chain: local bus first, then the broker.
///
/// The per-attempt deadline applies here, so a timeout surfaces as an
/// ordinary error to every middleware wrapped around the delivery.
struct Delivery {
    bus: Arc<EventBus>,
    publisher: Option<Arc<BrokerPublisher>>,
    deadline: Duration,
}

impl Delivery {
    async fn deliver(&self, ctx: &CancellationToken, event: &EventEnvelope, to_broker: bool) -> Result<()> {
        let attempt = ctx.child_token();
        let work = async {
            self.bus.publish(&attempt, event).await?;
            if let (true, Some(publisher)) = (to_broker, &self.publisher) {
                publisher.publish_event(event).await?;
            }
            Ok(())
        };
        match tokio::time::timeout(self.deadline, work).await {
            Ok(outcome) => outcome,
            Err(_) => {
                attempt.cancel();
                Err(EventError::Timeout(self.deadline.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl Endpoint for Delivery {
    async fn call(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()> {
        self.deliver(ctx, event, true).await
    }
}

/// Batch endpoint: delivers on the local bus and stages the broker message
/// for the batch's single flush.
struct StagedDelivery<'a> {
    delivery: &'a Delivery,
    publisher: &'a BrokerPublisher,
    staged: StdMutex<Option<(String, Vec<u8>)>>,
}

impl<'a> StagedDelivery<'a> {
    fn new(delivery: &'a Delivery, publisher: &'a BrokerPublisher) -> Self {
        Self { delivery, publisher, staged: StdMutex::new(None) }
    }

    fn take(&self) -> Result<(String, Vec<u8>)> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| EventError::HandlerExecution("event was accepted but never staged".into()))
    }
}

#[async_trait]
impl Endpoint for StagedDelivery<'_> {
    async fn call(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.delivery.deliver(ctx, event, false).await?;
        *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = Some((self.publisher.subject_for(event), payload));
        Ok(())
    }
}

/// State shared between the dispatcher handle, its loops and the pool processor.
struct Shared {
    config: DispatcherConfig,
    delivery: Delivery,
    chain: MiddlewareChain,
    /// `None` once the dispatcher stopped accepting work
    sender: StdMutex<Option<mpsc::Sender<QueuedMessage>>>,
    stats: RwLock<HashMap<String, EventTypeStats>>,
    dead_letters: StdMutex<VecDeque<DeadLetterRecord>>,
    token: CancellationToken,
    started_at: Instant,
}

impl Shared {
    fn enqueue(&self, message: QueuedMessage) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(EventError::PoolStopped);
        }
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(EventError::PoolStopped)?;
        sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => EventError::QueueFull,
            TrySendError::Closed(_) => EventError::PoolStopped,
        })
    }

    async fn update_stats(&self, event_type: &str, update: impl FnOnce(&mut EventTypeStats)) {
        let mut stats = self.stats.write().await;
        let entry = stats.entry(event_type.to_string()).or_default();
        update(entry);
        entry.touch();
    }

    /// One pass through the middleware chain into `endpoint`.
    async fn attempt(&self, event: &EventEnvelope, endpoint: &dyn Endpoint) -> Result<()> {
        self.chain.execute(&self.token.child_token(), event, endpoint).await
    }

    /// Attempt plus bookkeeping, shared by the sync and async paths.
    async fn attempt_recorded(&self, event: &EventEnvelope) -> Result<()> {
        let started = Instant::now();
        let outcome = self.attempt(event, &self.delivery).await;
        let elapsed = started.elapsed();
        let success = outcome.is_ok();
        self.update_stats(&event.event_type, |s| s.record_attempt(elapsed, success)).await;
        outcome
    }

    /// Worker pool processor for queued messages.
    async fn process(self: Arc<Self>, message: QueuedMessage) -> Result<()> {
        match self.attempt_recorded(&message.envelope).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_failure(message, &e).await;
                Err(e)
            }
        }
    }

    async fn handle_failure(self: &Arc<Self>, message: QueuedMessage, error: &EventError) {
        let event_type = message.event_type().to_string();

        if message.retry_count < self.config.max_retries {
            let next = message.next_attempt();
            let delay = self.config.retry_delay() * next.retry_count;
            debug!(
                "Retrying {} ({}) in {:?}, attempt {} of {}: {}",
                event_type,
                next.envelope.id,
                delay,
                next.retry_count + 1,
                self.config.max_retries + 1,
                error
            );
            self.update_stats(&event_type, |s| s.retried_count += 1).await;

            // Backoff runs on its own task so the worker is free meanwhile
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shared.token.cancelled() => {
                        shared.drop_message(&next, "dispatcher stopped before retry").await;
                        return;
                    }
                }
                match shared.enqueue(next.clone()) {
                    Ok(()) => {}
                    Err(EventError::QueueFull) => shared.drop_message(&next, "queue full on retry").await,
                    Err(e) => shared.drop_message(&next, &e.to_string()).await,
                }
            });
            return;
        }

        if self.config.enable_dead_letter {
            self.dead_letter(&message, error).await;
        } else {
            error!(
                "❌ Dropping {} ({}) after {} attempts: {}",
                event_type,
                message.envelope.id,
                message.retry_count + 1,
                error
            );
            self.update_stats(&event_type, |s| s.dropped_count += 1).await;
        }
    }

    async fn drop_message(&self, message: &QueuedMessage, reason: &str) {
        warn!(
            "⚠️ Dropped {} ({}) after {} attempt(s): {}",
            message.event_type(),
            message.envelope.id,
            message.retry_count,
            reason
        );
        self.update_stats(message.event_type(), |s| s.dropped_count += 1).await;
    }

    /// Records the dead letter right away; the broker copy is published on a
    /// separate task so publish retries never hold up the worker.
    async fn dead_letter(self: &Arc<Self>, message: &QueuedMessage, error: &EventError) {
        let event = &message.envelope;
        let subject = match &self.delivery.publisher {
            Some(publisher) => publisher.subject_for(event),
            None => event.event_type.clone(),
        };
        let data = serde_json::to_value(event.as_ref()).unwrap_or(serde_json::Value::Null);
        let record = DeadLetterRecord::new(subject, data, error, message.retry_count);

        warn!(
            "🗑️ Dead-lettering {} ({}) after {} attempts: {}",
            event.event_type,
            event.id,
            message.retry_count + 1,
            error
        );

        if let Some(publisher) = &self.delivery.publisher {
            match serde_json::to_vec(&record) {
                Ok(payload) => {
                    let publisher = Arc::clone(publisher);
                    let subject = self.config.dead_letter_subject.clone();
                    let id = event.id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = publisher.publish_message(&subject, payload).await {
                            error!("❌ Could not publish dead letter for {}: {}", id, e);
                        }
                    });
                }
                Err(e) => error!("❌ Could not encode dead letter for {}: {}", event.id, e),
            }
        }

        {
            let mut dead_letters = self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner);
            if dead_letters.len() >= self.config.dead_letter_capacity.max(1) {
                dead_letters.pop_front();
            }
            dead_letters.push_back(record);
        }
        self.update_stats(&event.event_type, |s| s.dead_lettered_count += 1).await;
    }

    fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Builder for [`EventDispatcher`].
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    bus: Arc<EventBus>,
    chain: MiddlewareChain,
    publisher: Option<Arc<BrokerPublisher>>,
}

impl DispatcherBuilder {
    /// Middleware wrapped around every delivery. Defaults to an empty chain.
    pub fn middleware(mut self, chain: MiddlewareChain) -> Self {
        self.chain = chain;
        self
    }

    /// Also publish every delivered event (and every dead letter) to the broker.
    pub fn publisher(mut self, publisher: Arc<BrokerPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn build(self) -> Result<EventDispatcher> {
        self.config.validate()?;

        let (tx, rx) = mpsc::channel(self.config.queue_size);
        let shared = Arc::new(Shared {
            delivery: Delivery {
                bus: self.bus,
                publisher: self.publisher,
                deadline: self.config.max_processing_time(),
            },
            chain: self.chain,
            sender: StdMutex::new(Some(tx)),
            stats: RwLock::new(HashMap::new()),
            dead_letters: StdMutex::new(VecDeque::new()),
            token: CancellationToken::new(),
            started_at: Instant::now(),
            config: self.config,
        });

        let processor_shared = shared.clone();
        let pool = WorkerPool::with_fn(
            "dispatcher",
            shared.config.worker_count,
            shared.config.queue_size,
            move |message: QueuedMessage| processor_shared.clone().process(message),
        )?;

        Ok(EventDispatcher {
            shared,
            receiver: StdMutex::new(Some(rx)),
            pool: Arc::new(pool),
            loops: Mutex::new(Vec::new()),
            metrics: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }
}

/// Asynchronous event delivery with batching, retries and dead-lettering.
pub struct EventDispatcher {
    shared: Arc<Shared>,
    /// Taken by the drain loop on start
    receiver: StdMutex<Option<mpsc::Receiver<QueuedMessage>>>,
    pool: Arc<WorkerPool<QueuedMessage>>,
    /// Drain and batch loops
    loops: Mutex<Vec<JoinHandle<()>>>,
    metrics: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl EventDispatcher {
    pub fn builder(config: DispatcherConfig, bus: Arc<EventBus>) -> DispatcherBuilder {
        DispatcherBuilder {
            config,
            bus,
            chain: MiddlewareChain::new(),
            publisher: None,
        }
    }

    /// A dispatcher over `bus` with no middleware and no broker.
    pub fn new(config: DispatcherConfig, bus: Arc<EventBus>) -> Result<Self> {
        Self::builder(config, bus).build()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.shared.delivery.bus
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.shared.chain
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.shared.delivery.bus.subscribe(handler).await
    }

    pub async fn unsubscribe(&self, handler_name: &str, event_type: &str) -> Result<()> {
        self.shared.delivery.bus.unsubscribe(handler_name, event_type).await
    }

    /// Delivers `event` now and returns the delivery outcome unchanged.
    pub async fn dispatch(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        self.shared
            .update_stats(&event.event_type, |s| s.dispatched_count += 1)
            .await;
        self.shared.attempt_recorded(event).await
    }

    /// Enqueues `event` without waiting for queue space.
    ///
    /// Fails with `Cancelled` if `ctx` is already cancelled, `QueueFull` if
    /// the queue has no free slot and `PoolStopped` after [`stop`](Self::stop).
    /// Processing errors are never returned here; they only show up in stats,
    /// logs and the dead-letter output.
    pub async fn dispatch_async(&self, ctx: &CancellationToken, event: EventEnvelope) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        let message = QueuedMessage::new(Arc::new(event));
        let event_type = message.event_type().to_string();

        match self.shared.enqueue(message) {
            Ok(()) => {
                self.shared.update_stats(&event_type, |s| s.dispatched_count += 1).await;
                Ok(())
            }
            Err(EventError::QueueFull) => {
                debug!("🚦 Queue full, rejected {}", event_type);
                self.shared.update_stats(&event_type, |s| s.rejected_count += 1).await;
                Err(EventError::QueueFull)
            }
            Err(e) => Err(e),
        }
    }

    /// Delivers `events` as one group.
    ///
    /// Every event runs through the middleware chain and onto the local bus.
    /// With a broker attached, the events the chain accepted then go out in a
    /// single batch publish. Failures are collected into one `BatchFailed`
    /// error and nothing already delivered is rolled back.
    pub async fn dispatch_batch(&self, ctx: &CancellationToken, events: Vec<EventEnvelope>) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        if events.is_empty() {
            return Ok(());
        }

        for event in &events {
            self.shared
                .update_stats(&event.event_type, |s| s.dispatched_count += 1)
                .await;
        }

        let mut failures = Vec::new();
        match &self.shared.delivery.publisher {
            Some(publisher) => {
                let mut staged = Vec::with_capacity(events.len());
                for event in &events {
                    let endpoint = StagedDelivery::new(&self.shared.delivery, publisher);
                    let started = Instant::now();
                    let outcome = self.shared.attempt(event, &endpoint).await.and_then(|()| endpoint.take());
                    match outcome {
                        Ok(message) => staged.push((event, message, started.elapsed())),
                        Err(e) => {
                            let elapsed = started.elapsed();
                            self.shared
                                .update_stats(&event.event_type, |s| s.record_attempt(elapsed, false))
                                .await;
                            failures.push(BatchFailure { subject: publisher.subject_for(event), message: e.to_string() });
                        }
                    }
                }

                let started = Instant::now();
                let (accepted, messages): (Vec<_>, Vec<_>) = staged
                    .into_iter()
                    .map(|(event, message, elapsed)| ((event, elapsed), message))
                    .unzip();
                let outcomes = publisher.publish_each(messages).await;
                let flush_share = started.elapsed() / outcomes.len().max(1) as u32;
                for ((event, elapsed), outcome) in accepted.into_iter().zip(outcomes) {
                    let success = outcome.is_ok();
                    self.shared
                        .update_stats(&event.event_type, |s| s.record_attempt(elapsed + flush_share, success))
                        .await;
                    if let Err(e) = outcome {
                        failures.push(BatchFailure { subject: publisher.subject_for(event), message: e.to_string() });
                    }
                }
            }
            None => {
                for event in &events {
                    if let Err(e) = self.shared.attempt_recorded(event).await {
                        failures.push(BatchFailure { subject: event.event_type.clone(), message: e.to_string() });
                    }
                }
            }
        }

        if failures.is_empty() {
            debug!("📤 Dispatched batch of {} events", events.len());
            Ok(())
        } else {
            warn!("⚠️ {} of {} batch events failed", failures.len(), events.len());
            Err(EventError::BatchFailed(failures))
        }
    }

    /// Starts the worker pool and the drain, batch and metrics loops.
    ///
    /// Cancelling `ctx` shuts everything down without draining. A second
    /// call is a no-op.
    pub async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("⚠️ Dispatcher already started");
            return Ok(());
        }
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(EventError::PoolStopped)?;

        let token = self.shared.token.clone();
        self.pool.start(&token).await;

        let (batch_tx, batch_rx) = mpsc::channel(self.shared.config.batch_size);
        {
            let mut loops = self.loops.lock().await;
            loops.push(tokio::spawn(drain_loop(receiver, batch_tx, token.clone())));
            loops.push(tokio::spawn(batch_loop(batch_rx, self.pool.clone(), self.shared.clone())));
        }
        *self.metrics.lock().await = Some(tokio::spawn(metrics_loop(self.shared.clone(), self.pool.clone())));

        let parent = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => token.cancel(),
                _ = token.cancelled() => {}
            }
        });

        info!(
            "🚀 Dispatcher started: {} workers, queue {}, batch {} / {:?}",
            self.shared.config.worker_count,
            self.shared.config.queue_size,
            self.shared.config.batch_size,
            self.shared.config.batch_timeout()
        );
        Ok(())
    }

    /// Stops accepting work, delivers what is already queued, then shuts the
    /// loops and the pool down. Retries still waiting for their backoff are
    /// dropped. Idempotent.
    pub async fn stop(&self) {
        let closed = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if closed {
            info!("🛑 Stopping dispatcher");
        }
        // Never started: nothing will ever drain the queue
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take();

        // Drain and batch loops finish on their own once the queue is empty
        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                error!("❌ Dispatcher loop ended abnormally: {}", e);
            }
        }

        self.pool.stop().await;
        self.shared.token.cancel();
        if let Some(metrics) = self.metrics.lock().await.take() {
            if let Err(e) = metrics.await {
                error!("❌ Metrics loop ended abnormally: {}", e);
            }
        }
        if closed {
            info!("🛑 Dispatcher stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.token.is_cancelled()
    }

    /// Messages waiting in the dispatcher queue.
    pub fn queue_depth(&self) -> usize {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0)
    }

    /// Deep copy of the current counters.
    pub async fn get_stats(&self) -> DispatcherStats {
        snapshot(&self.shared, &self.pool).await
    }

    /// Clears the per-event-type counters.
    pub async fn reset_stats(&self) {
        self.shared.stats.write().await.clear();
        info!("📊 Dispatcher statistics reset");
    }

    /// Copy of the in-memory dead-letter log, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Empties the dead-letter log and returns its contents, oldest first.
    pub fn drain_dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.shared
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("running", &self.is_running())
            .field("queue_depth", &self.queue_depth())
            .field("middleware", &self.shared.chain)
            .field("pool", &self.pool)
            .finish()
    }
}

async fn snapshot(shared: &Shared, pool: &WorkerPool<QueuedMessage>) -> DispatcherStats {
    let by_event_type = shared.stats.read().await.clone();
    let queue_depth = shared
        .sender
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|tx| tx.max_capacity() - tx.capacity())
        .unwrap_or(0);
    DispatcherStats {
        by_event_type,
        pool: pool.stats().await,
        queue_depth,
        dead_letters: shared.dead_letter_count(),
        uptime_seconds: shared.started_at.elapsed().as_secs(),
    }
}

/// Moves queued messages to the batcher until the queue is closed and empty.
async fn drain_loop(
    mut receiver: mpsc::Receiver<QueuedMessage>,
    batch_tx: mpsc::Sender<QueuedMessage>,
    token: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            message = receiver.recv() => message,
        };
        let Some(message) = message else { break };
        if batch_tx.send(message).await.is_err() {
            break;
        }
    }
    debug!("Drain loop exiting");
}

/// Groups messages and hands them to the pool when `batch_size` is reached
/// or `batch_timeout` elapses, whichever comes first. A size-triggered flush
/// restarts the timer.
async fn batch_loop(
    mut batch_rx: mpsc::Receiver<QueuedMessage>,
    pool: Arc<WorkerPool<QueuedMessage>>,
    shared: Arc<Shared>,
) {
    let batch_size = shared.config.batch_size;
    let mut pending: Vec<QueuedMessage> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(shared.config.batch_timeout());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            message = batch_rx.recv() => match message {
                Some(message) => {
                    pending.push(message);
                    if pending.len() >= batch_size {
                        flush(&mut pending, &pool, &shared).await;
                        ticker.reset();
                    }
                }
                None => {
                    flush(&mut pending, &pool, &shared).await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if !pending.is_empty() {
                    flush(&mut pending, &pool, &shared).await;
                }
            }
        }
    }
    debug!("Batch loop exiting");
}

async fn flush(pending: &mut Vec<QueuedMessage>, pool: &WorkerPool<QueuedMessage>, shared: &Shared) {
    let count = pending.len();
    for message in pending.drain(..) {
        let handed_over = tokio::select! {
            outcome = pool.submit_wait(message.clone()) => outcome,
            _ = shared.token.cancelled() => Err(EventError::PoolStopped),
        };
        if let Err(e) = handed_over {
            shared.drop_message(&message, &e.to_string()).await;
        }
    }
    debug!("📤 Flushed batch of {} messages to pool", count);
}

async fn metrics_loop(shared: Arc<Shared>, pool: Arc<WorkerPool<QueuedMessage>>) {
    let mut ticker = tokio::time::interval(shared.config.metrics_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.reset();

    loop {
        tokio::select! {
            _ = shared.token.cancelled() => break,
            _ = ticker.tick() => {
                let stats = snapshot(&shared, &pool).await;
                info!("📊 Dispatcher stats: {}", stats.summary());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::{BrokerConfig, MiddlewareConfig};
    use crate::handler::FnHandler;
    use crate::middleware::{CircuitBreakerMiddleware, CircuitState, MetricsMiddleware};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            worker_count: 2,
            queue_size: 16,
            batch_size: 4,
            batch_timeout_ms: 10,
            max_retries: 2,
            retry_delay_ms: 5,
            max_processing_time_ms: 1000,
            ..DispatcherConfig::default()
        }
    }

    fn login() -> EventEnvelope {
        EventEnvelope::new("player.login", "player", "p-1", json!({})).with_actor("p-1")
    }

    async fn counting_bus(fail: bool) -> (Arc<EventBus>, Arc<AtomicUsize>) {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            FnHandler::new("login-handler", ["player.login"], move |_ctx, _event| {
                let calls = c.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if fail {
                        Err(EventError::HandlerExecution("session store down".into()))
                    } else {
                        Ok(())
                    }
                }
            })
            .shared(),
        )
        .await
        .unwrap();
        (bus, calls)
    }

    #[tokio::test]
    async fn test_sync_dispatch_returns_handler_error() {
        let (bus, calls) = counting_bus(true).await;
        let dispatcher = EventDispatcher::new(config(), bus).unwrap();
        let ctx = CancellationToken::new();

        let err = dispatcher.dispatch(&ctx, &login()).await.unwrap_err();
        assert!(matches!(err, EventError::HandlerFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = dispatcher.get_stats().await;
        assert_eq!(stats.by_event_type["player.login"].dispatched_count, 1);
        assert_eq!(stats.by_event_type["player.login"].failed_count, 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_is_rejected() {
        let (bus, _) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(config(), bus).unwrap();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(dispatcher.dispatch_async(&ctx, login()).await, Err(EventError::Cancelled));
        assert_eq!(dispatcher.dispatch(&ctx, &login()).await, Err(EventError::Cancelled));
        assert_eq!(dispatcher.queue_depth(), 0);
    }

    #[tokio::test]
    async fn test_middleware_runs_on_sync_path() {
        let (bus, calls) = counting_bus(false).await;
        let dispatcher = EventDispatcher::builder(config(), bus)
            .middleware(MiddlewareChain::standard(&MiddlewareConfig::default()))
            .build()
            .unwrap();
        let ctx = CancellationToken::new();

        let anonymous = EventEnvelope::new("player.login", "player", "p-1", json!({}));
        assert!(matches!(
            dispatcher.dispatch(&ctx, &anonymous).await,
            Err(EventError::Unauthenticated(_))
        ));
        dispatcher.dispatch(&ctx, &login()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let bus = Arc::new(EventBus::new());
        bus.subscribe(
            FnHandler::new("slow", ["player.login"], |_ctx, _event| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .shared(),
        )
        .await
        .unwrap();
        let dispatcher = EventDispatcher::new(
            DispatcherConfig { max_processing_time_ms: 20, ..config() },
            bus,
        )
        .unwrap();

        let result = dispatcher.dispatch(&CancellationToken::new(), &login()).await;
        assert_eq!(result, Err(EventError::Timeout(20)));
    }

    #[tokio::test]
    async fn test_async_path_delivers_and_stop_drains() {
        let (bus, calls) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(config(), bus).unwrap();
        let ctx = CancellationToken::new();

        for _ in 0..10 {
            dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        }
        dispatcher.start(&ctx).await.unwrap();
        dispatcher.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        let stats = dispatcher.get_stats().await;
        assert_eq!(stats.by_event_type["player.login"].processed_count, 10);
        assert_eq!(stats.pool.total_processed(), 10);
        assert!(!dispatcher.is_running());
        assert_eq!(dispatcher.dispatch_async(&ctx, login()).await, Err(EventError::PoolStopped));
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_dropped_when_dead_letter_disabled() {
        let (bus, calls) = counting_bus(true).await;
        let dispatcher = EventDispatcher::new(
            DispatcherConfig { enable_dead_letter: false, ..config() },
            bus,
        )
        .unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();
        dispatcher.dispatch_async(&ctx, login()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = dispatcher.get_stats().await;
        let login = &stats.by_event_type["player.login"];
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(login.retried_count, 2);
        assert_eq!(login.dropped_count, 1);
        assert_eq!(login.dead_lettered_count, 0);
        assert!(dispatcher.dead_letters().is_empty());
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_dead_letter_log_is_bounded() {
        let (bus, _) = counting_bus(true).await;
        let dispatcher = EventDispatcher::new(
            DispatcherConfig { max_retries: 0, dead_letter_capacity: 2, ..config() },
            bus,
        )
        .unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();
        for _ in 0..3 {
            dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        }
        dispatcher.stop().await;

        assert_eq!(dispatcher.dead_letters().len(), 2);
        assert_eq!(dispatcher.drain_dead_letters().len(), 2);
        assert!(dispatcher.dead_letters().is_empty());
        let stats = dispatcher.get_stats().await;
        assert_eq!(stats.by_event_type["player.login"].dead_lettered_count, 3);
    }

    #[tokio::test]
    async fn test_batch_without_broker_uses_local_bus() {
        let (bus, calls) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(config(), bus).unwrap();
        let ctx = CancellationToken::new();

        let unknown = EventEnvelope::new("guild.created", "guild", "g-1", json!({}));
        dispatcher
            .dispatch_batch(&ctx, vec![login(), login(), unknown])
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let stats = dispatcher.get_stats().await;
        assert_eq!(stats.by_event_type["player.login"].dispatched_count, 2);
        assert_eq!(stats.by_event_type["guild.created"].processed_count, 1);
    }

    #[tokio::test]
    async fn test_start_twice_and_reset_stats() {
        let (bus, _) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(config(), bus).unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();
        dispatcher.start(&ctx).await.unwrap();
        assert!(dispatcher.is_running());

        dispatcher.dispatch(&ctx, &login()).await.unwrap();
        dispatcher.reset_stats().await;
        assert!(dispatcher.get_stats().await.by_event_type.is_empty());

        ctx.cancel();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dispatcher.is_running());
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_timeouts_are_seen_by_middleware() {
        let bus = Arc::new(EventBus::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        bus.subscribe(
            FnHandler::new("stuck", ["player.login"], move |_ctx, _event| {
                let calls = c.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                }
            })
            .shared(),
        )
        .await
        .unwrap();
        let breaker = Arc::new(CircuitBreakerMiddleware::new(2, Duration::from_secs(30)));
        let metrics = Arc::new(MetricsMiddleware::new());
        let dispatcher = EventDispatcher::builder(DispatcherConfig { max_processing_time_ms: 20, ..config() }, bus)
            .middleware(MiddlewareChain::new().with_shared(breaker.clone()).with_shared(metrics.clone()))
            .build()
            .unwrap();
        let ctx = CancellationToken::new();

        assert_eq!(dispatcher.dispatch(&ctx, &login()).await, Err(EventError::Timeout(20)));
        assert_eq!(dispatcher.dispatch(&ctx, &login()).await, Err(EventError::Timeout(20)));
        assert_eq!(
            dispatcher.dispatch(&ctx, &login()).await,
            Err(EventError::CircuitOpen("player.login".into()))
        );

        assert_eq!(breaker.state("player.login"), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let recorded = metrics.for_type("player.login").unwrap();
        assert_eq!(recorded.failure_count, 2);
        assert_eq!(recorded.recent_durations_us.len(), 2);
    }

    #[tokio::test]
    async fn test_broker_batch_runs_through_chain_and_bus() {
        let (bus, calls) = counting_bus(false).await;
        let broker = Arc::new(InMemoryBroker::new());
        let publisher = Arc::new(BrokerPublisher::new(broker.clone(), BrokerConfig::default()));
        let dispatcher = EventDispatcher::builder(config(), bus)
            .middleware(MiddlewareChain::standard(&MiddlewareConfig::default()))
            .publisher(publisher)
            .build()
            .unwrap();
        let ctx = CancellationToken::new();

        let anonymous = EventEnvelope::new("player.login", "player", "p-2", json!({}));
        let ancient = login().with_occurred_at(1);
        let err = dispatcher
            .dispatch_batch(&ctx, vec![login(), anonymous, ancient])
            .await
            .unwrap_err();

        match err {
            EventError::BatchFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures.iter().all(|f| f.subject == "game.events.player.player.login"));
            }
            other => panic!("expected BatchFailed, got {other:?}"),
        }
        assert_eq!(broker.published_count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = dispatcher.get_stats().await;
        assert_eq!(stats.by_event_type["player.login"].processed_count, 1);
        assert_eq!(stats.by_event_type["player.login"].failed_count, 2);
    }

    fn batching_config() -> DispatcherConfig {
        DispatcherConfig { batch_size: 3, batch_timeout_ms: 100, ..config() }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_batch_flushes_on_timer() {
        let (bus, calls) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(batching_config(), bus).unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        dispatcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_restarts_batch_timer() {
        let (bus, calls) = counting_bus(false).await;
        let dispatcher = EventDispatcher::new(batching_config(), bus).unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        // Full batch at 60ms moves the next tick from 100ms to 160ms
        tokio::time::sleep(Duration::from_millis(60)).await;
        for _ in 0..3 {
            dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn test_dead_letter_publish_does_not_hold_worker() {
        let (bus, _) = counting_bus(true).await;
        let broker = Arc::new(InMemoryBroker::new());
        let broker_config = BrokerConfig {
            publish_attempts: 2,
            publish_retry_delay_ms: 2_000,
            ..BrokerConfig::default()
        };
        let publisher = Arc::new(BrokerPublisher::new(broker.clone(), broker_config));
        let dispatcher = EventDispatcher::builder(DispatcherConfig { worker_count: 1, max_retries: 0, ..config() }, bus)
            .publisher(publisher)
            .build()
            .unwrap();
        let ctx = CancellationToken::new();
        dispatcher.start(&ctx).await.unwrap();

        // The handler fails before the broker is touched, so the dead letter is the first publish
        broker.fail_next_publishes(1);
        dispatcher.dispatch_async(&ctx, login()).await.unwrap();
        let recorded = tokio::time::timeout(Duration::from_millis(500), async {
            while dispatcher.dead_letters().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(recorded.is_ok());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.published_count(), 0);

        // The dead letter is still backing off; the lone worker must be free
        let guild = EventEnvelope::new("guild.created", "guild", "g-1", json!({}));
        dispatcher.dispatch_async(&ctx, guild).await.unwrap();
        let delivered = tokio::time::timeout(Duration::from_millis(500), async {
            while broker.published_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(delivered.is_ok());
        dispatcher.stop().await;
    }
}
