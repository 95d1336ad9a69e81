//! Node assembly
//!
//! A [`BackboneNode`] wires one broker connection, the publisher and
//! subscriber on top of it, a local bus and the dispatcher with the standard
//! middleware chain. It also announces its own lifecycle through `system.*`
//! events and watches the dead-letter subjects.

use event_backbone::{
    current_timestamp_millis, BrokerConnection, BrokerMessage, BrokerPublisher, BrokerSubscriber, DeadLetterRecord,
    DispatcherStats, EventBus, EventDispatcher, EventEnvelope, EventError, EventHandler, FnHandler, InMemoryBroker,
    MiddlewareChain, Result,
};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;

const NODE_AGGREGATE: &str = "node";

/// Tracks `system.health` events seen on the local bus.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatMonitor {
    beats: Arc<AtomicU64>,
    last_seen_ms: Arc<AtomicU64>,
}

impl HeartbeatMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bus handler feeding this monitor.
    pub fn handler(&self) -> Arc<dyn EventHandler> {
        let monitor = self.clone();
        FnHandler::new("heartbeat_monitor", ["system.health"], move |_ctx, event| {
            let monitor = monitor.clone();
            async move {
                let beat = monitor.beats.fetch_add(1, Ordering::Relaxed) + 1;
                monitor.last_seen_ms.store(event.occurred_at, Ordering::Relaxed);
                debug!("💓 Heartbeat {} from {}", beat, event.aggregate_id);
                Ok(())
            }
        })
        .shared()
    }

    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }

    /// Timestamp of the latest heartbeat, if any arrived.
    pub fn last_seen_ms(&self) -> Option<u64> {
        match self.last_seen_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Some(ms),
        }
    }

    /// Whether a heartbeat arrived within `window`.
    pub fn is_alive(&self, window: Duration) -> bool {
        self.last_seen_ms()
            .map(|seen| current_timestamp_millis().saturating_sub(seen) <= window.as_millis() as u64)
            .unwrap_or(false)
    }
}

/// One event backbone node.
pub struct BackboneNode {
    config: Config,
    broker: Arc<InMemoryBroker>,
    subscriber: Arc<BrokerSubscriber>,
    dispatcher: Arc<EventDispatcher>,
    monitor: HeartbeatMonitor,
    dead_letters_seen: Arc<AtomicU64>,
    token: CancellationToken,
    heartbeat_token: CancellationToken,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BackboneNode {
    pub fn new(config: Config) -> Result<Self> {
        let engine = config.engine();
        engine.validate()?;

        let broker = Arc::new(InMemoryBroker::new());
        let connection: Arc<dyn BrokerConnection> = broker.clone();
        let publisher = Arc::new(BrokerPublisher::new(connection.clone(), engine.broker.clone()));
        let subscriber = Arc::new(BrokerSubscriber::new(connection, engine.broker.clone()));

        let bus = Arc::new(EventBus::new());
        let dispatcher = EventDispatcher::builder(engine.dispatcher.clone(), bus)
            .middleware(MiddlewareChain::standard(&engine.middleware))
            .publisher(publisher)
            .build()?;

        let token = CancellationToken::new();
        let heartbeat_token = token.child_token();
        Ok(Self {
            config,
            broker,
            subscriber,
            dispatcher: Arc::new(dispatcher),
            monitor: HeartbeatMonitor::new(),
            dead_letters_seen: Arc::new(AtomicU64::new(0)),
            token,
            heartbeat_token,
            heartbeat: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    pub fn subscriber(&self) -> &Arc<BrokerSubscriber> {
        &self.subscriber
    }

    pub fn broker(&self) -> &Arc<InMemoryBroker> {
        &self.broker
    }

    pub fn monitor(&self) -> &HeartbeatMonitor {
        &self.monitor
    }

    /// Cancelling this token hard-stops the node without draining.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Dead-letter records observed on the broker.
    pub fn dead_letters_seen(&self) -> u64 {
        self.dead_letters_seen.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.dispatcher.get_stats().await
    }

    /// Starts the dispatcher, the dead-letter watchers and the heartbeat,
    /// then announces `system.start`.
    pub async fn start(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(EventError::Cancelled);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("⚠️ Node {} already started", self.config.node.name);
            return Ok(());
        }

        self.dispatcher.subscribe(self.monitor.handler()).await?;
        for subject in self.dead_letter_subjects() {
            self.watch_dead_letters(&subject).await?;
        }
        self.dispatcher.start(&self.token).await?;
        self.dispatcher
            .dispatch(&self.token, &self.system_event("system.start", json!({"version": env!("CARGO_PKG_VERSION")})))
            .await?;

        if let Some(interval) = self.config.node.heartbeat_interval() {
            let handle = tokio::spawn(heartbeat_loop(
                self.dispatcher.clone(),
                self.config.node.name.clone(),
                interval,
                self.heartbeat_token.clone(),
            ));
            *self.heartbeat.lock().await = Some(handle);
        }

        info!("✅ Node {} started", self.config.node.name);
        Ok(())
    }

    /// Announces `system.stop`, drains the dispatcher and closes the broker
    /// side. Safe to call more than once.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }

        self.heartbeat_token.cancel();
        if let Some(handle) = self.heartbeat.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("⚠️ Heartbeat task ended abnormally: {}", e);
            }
        }

        let stop = self.system_event("system.stop", json!({"uptime_seconds": self.stats().await.uptime_seconds}));
        if let Err(e) = self.dispatcher.dispatch(&self.token, &stop).await {
            warn!("⚠️ Failed to announce shutdown: {}", e);
        }

        self.dispatcher.stop().await;
        self.subscriber.stop().await;
        self.token.cancel();
        info!("🛑 Node {} stopped", self.config.node.name);
    }

    fn system_event(&self, event_type: &str, data: serde_json::Value) -> EventEnvelope {
        EventEnvelope::new(event_type, NODE_AGGREGATE, &self.config.node.name, data)
    }

    fn dead_letter_subjects(&self) -> Vec<String> {
        let mut subjects = Vec::new();
        if self.config.dispatcher.enable_dead_letter {
            subjects.push(self.config.dispatcher.dead_letter_subject.clone());
        }
        if let Some(subject) = &self.config.broker.dead_letter_subject {
            if !subjects.contains(subject) {
                subjects.push(subject.clone());
            }
        }
        subjects
    }

    async fn watch_dead_letters(&self, subject: &str) -> Result<()> {
        let seen = self.dead_letters_seen.clone();
        self.subscriber
            .subscribe(subject, move |message: BrokerMessage| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::Relaxed);
                    match serde_json::from_slice::<DeadLetterRecord>(&message.payload) {
                        Ok(record) => error!(
                            "🗑️ Dead letter on {}: {} after {} retries: {}",
                            message.subject, record.original_subject, record.retry_count, record.error
                        ),
                        Err(e) => warn!("⚠️ Unreadable dead letter on {}: {}", message.subject, e),
                    }
                    Ok(())
                }
            })
            .await
    }
}

async fn heartbeat_loop(dispatcher: Arc<EventDispatcher>, node: String, interval: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.reset();

    let mut sequence: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                sequence += 1;
                let beat = EventEnvelope::new(
                    "system.health",
                    NODE_AGGREGATE,
                    &node,
                    json!({"sequence": sequence, "queue_depth": dispatcher.queue_depth()}),
                );
                if let Err(e) = dispatcher.dispatch_async(&token, beat).await {
                    warn!("⚠️ Heartbeat {} not queued: {}", sequence, e);
                }
            }
        }
    }
    debug!("🛑 Heartbeat loop for {} stopped", node);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.node.heartbeat_interval_ms = 20;
        config.dispatcher.worker_count = 2;
        config.dispatcher.batch_timeout_ms = 5;
        config.dispatcher.max_retries = 0;
        config
    }

    async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn test_monitor_liveness() {
        let monitor = HeartbeatMonitor::new();
        assert!(!monitor.is_alive(Duration::from_secs(1)));
        monitor.last_seen_ms.store(current_timestamp_millis(), Ordering::Relaxed);
        assert!(monitor.is_alive(Duration::from_secs(1)));
        assert_eq!(monitor.beats(), 0);
    }

    #[tokio::test]
    async fn test_node_emits_heartbeats() {
        let node = BackboneNode::new(fast_config()).unwrap();
        node.start().await.unwrap();

        assert!(wait_until(|| node.monitor().beats() >= 2).await);
        assert!(node.monitor().is_alive(Duration::from_secs(5)));

        node.stop().await;
        let stats = node.stats().await;
        assert!(stats.by_event_type["system.health"].processed_count >= 2);
        assert_eq!(stats.by_event_type["system.start"].processed_count, 1);
        assert_eq!(stats.by_event_type["system.stop"].processed_count, 1);
        assert!(node.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_node_watches_dead_letters() {
        let node = BackboneNode::new(fast_config()).unwrap();
        node.dispatcher()
            .subscribe(
                FnHandler::new("broken_quest_log", ["quest.complete"], |_ctx, _event| async {
                    Err(EventError::HandlerExecution("quest log offline".into()))
                })
                .shared(),
            )
            .await
            .unwrap();
        node.start().await.unwrap();

        let quest = EventEnvelope::new("quest.complete", "quest", "q-7", json!({"reward": 50})).with_actor("p-1");
        node.dispatcher().dispatch_async(node.token(), quest).await.unwrap();

        assert!(wait_until(|| node.dead_letters_seen() == 1 && node.dispatcher().dead_letters().len() == 1).await);
        assert_eq!(node.dispatcher().dead_letters()[0].retry_count, 0);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_and_restart_rejected() {
        let mut config = fast_config();
        config.node.heartbeat_interval_ms = 0;
        let node = BackboneNode::new(config).unwrap();

        node.start().await.unwrap();
        node.start().await.unwrap();
        assert_eq!(node.subscriber().subscriptions().await.len(), 1);

        node.stop().await;
        node.stop().await;
        assert!(matches!(node.start().await, Err(EventError::Cancelled)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.dispatcher.worker_count = 0;
        assert!(matches!(BackboneNode::new(config), Err(EventError::InvalidConfig(_))));
    }
}
