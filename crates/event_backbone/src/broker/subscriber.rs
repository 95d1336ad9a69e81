use super::{BrokerConnection, BrokerMessage};
use crate::bus::EventBus;
use crate::config::BrokerConfig;
use crate::envelope::{DeadLetterRecord, EventEnvelope};
use crate::error::{EventError, Result};
use crate::handler::EventHandler;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked for every inbound message on a subject.
pub type MessageHandler = Arc<dyn Fn(BrokerMessage) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Public view of one active subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub subject: String,
    pub queue_group: Option<String>,
    pub handlers: usize,
}

type SubscriptionKey = (String, Option<String>);

struct ActiveSubscription {
    id: u64,
    handlers: Arc<RwLock<Vec<MessageHandler>>>,
    task: JoinHandle<()>,
}

/// What happens to an inbound message whose handler keeps failing.
#[derive(Clone)]
struct FailurePolicy {
    connection: Arc<dyn BrokerConnection>,
    dead_letter_subject: Option<String>,
    handler_retries: u32,
}

impl FailurePolicy {
    async fn deliver(&self, handler: &MessageHandler, message: &BrokerMessage) {
        let mut retry_count = 0;
        loop {
            let outcome = match AssertUnwindSafe(handler(message.clone())).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(EventError::HandlerExecution(format!("handler for {} panicked", message.subject))),
            };
            match outcome {
                Ok(()) => return,
                Err(e) if retry_count < self.handler_retries => {
                    retry_count += 1;
                    warn!("⚠️ Handler for {} failed, retry {}/{}: {}", message.subject, retry_count, self.handler_retries, e);
                }
                Err(e) => {
                    self.dead_letter(message, &e, retry_count).await;
                    return;
                }
            }
        }
    }

    async fn dead_letter(&self, message: &BrokerMessage, error: &EventError, retry_count: u32) {
        let Some(subject) = &self.dead_letter_subject else {
            error!("❌ Handler for {} failed: {}", message.subject, error);
            return;
        };

        let record = DeadLetterRecord::from_payload(&message.subject, &message.payload, error, retry_count);
        let outcome = match serde_json::to_vec(&record) {
            Ok(payload) => self.connection.publish(BrokerMessage::new(subject.clone(), payload)).await,
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(()) => warn!("🗑️ Dead-lettered message from {} to {}: {}", message.subject, subject, error),
            Err(e) => error!("❌ Could not dead-letter message from {}: {}", message.subject, e),
        }
    }
}

/// Consumes broker subjects and hands messages to local handlers.
///
/// Registering another handler for a subject that is already subscribed
/// appends it to that subscription instead of opening a second one.
pub struct BrokerSubscriber {
    connection: Arc<dyn BrokerConnection>,
    config: BrokerConfig,
    subscriptions: Mutex<HashMap<SubscriptionKey, ActiveSubscription>>,
    token: CancellationToken,
    stopped: AtomicBool,
}

impl BrokerSubscriber {
    pub fn new(connection: Arc<dyn BrokerConnection>, config: BrokerConfig) -> Self {
        Self {
            connection,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            token: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Handles every message on `subject`.
    pub async fn subscribe<F, Fut>(&self, subject: &str, handler: F) -> Result<()>
    where
        F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(subject, None, Arc::new(move |message: BrokerMessage| handler(message).boxed()))
            .await
    }

    /// Handles messages on `subject` as a member of `queue_group`; each
    /// message reaches one member of the group.
    pub async fn subscribe_queue<F, Fut>(&self, subject: &str, queue_group: &str, handler: F) -> Result<()>
    where
        F: Fn(BrokerMessage) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.add_handler(subject, Some(queue_group), Arc::new(move |message: BrokerMessage| handler(message).boxed()))
            .await
    }

    /// Decodes inbound envelopes and passes them to `handler`.
    pub async fn subscribe_events(&self, subject: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        let token = self.token.clone();
        self.subscribe(subject, move |message: BrokerMessage| {
            let handler = handler.clone();
            let token = token.clone();
            async move {
                let event: EventEnvelope = serde_json::from_slice(&message.payload)?;
                handler.handle(&token, &event).await
            }
        })
        .await
    }

    /// Republishes inbound envelopes on a local bus.
    pub async fn bridge_to_bus(&self, subject: &str, bus: Arc<EventBus>) -> Result<()> {
        let token = self.token.clone();
        self.subscribe(subject, move |message: BrokerMessage| {
            let bus = bus.clone();
            let token = token.clone();
            async move {
                let event: EventEnvelope = serde_json::from_slice(&message.payload)?;
                bus.publish(&token, &event).await
            }
        })
        .await
    }

    async fn add_handler(&self, subject: &str, queue_group: Option<&str>, handler: MessageHandler) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EventError::BrokerUnavailable("subscriber stopped".into()));
        }

        let key = (subject.to_string(), queue_group.map(str::to_string));
        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(existing) = subscriptions.get(&key) {
            existing.handlers.write().await.push(handler);
            debug!("📝 Added handler to existing subscription on {}", subject);
            return Ok(());
        }

        let subscription = self.connection.subscribe(subject, queue_group).await?;
        let handlers = Arc::new(RwLock::new(vec![handler]));
        let policy = FailurePolicy {
            connection: self.connection.clone(),
            dead_letter_subject: self.config.dead_letter_subject.clone(),
            handler_retries: self.config.handler_retries,
        };
        let task = tokio::spawn(Self::delivery_loop(
            subscription.receiver,
            handlers.clone(),
            policy,
            self.token.clone(),
        ));

        info!("📝 Subscribed to {} (group {:?})", subject, queue_group);
        subscriptions.insert(key, ActiveSubscription { id: subscription.id, handlers, task });
        Ok(())
    }

    async fn delivery_loop(
        mut receiver: mpsc::Receiver<BrokerMessage>,
        handlers: Arc<RwLock<Vec<MessageHandler>>>,
        policy: FailurePolicy,
        token: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                message = receiver.recv() => message,
            };
            let Some(message) = message else { break };

            let current = handlers.read().await.clone();
            for handler in &current {
                policy.deliver(handler, &message).await;
            }
        }
    }

    /// Drops every subscription on `subject` (all queue groups). Unknown subjects are ignored.
    pub async fn unsubscribe(&self, subject: &str) -> Result<()> {
        let removed: Vec<ActiveSubscription> = {
            let mut subscriptions = self.subscriptions.lock().await;
            let keys: Vec<SubscriptionKey> = subscriptions
                .keys()
                .filter(|(s, _)| s == subject)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| subscriptions.remove(key)).collect()
        };

        for subscription in removed {
            subscription.task.abort();
            self.connection.unsubscribe(subscription.id).await?;
            info!("🗑️ Unsubscribed from {}", subject);
        }
        Ok(())
    }

    /// Unsubscribes everything and closes the connection. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        let drained: Vec<ActiveSubscription> = self.subscriptions.lock().await.drain().map(|(_, s)| s).collect();
        for subscription in drained {
            subscription.task.abort();
            if let Err(e) = self.connection.unsubscribe(subscription.id).await {
                warn!("⚠️ Unsubscribe of {} failed during stop: {}", subscription.id, e);
            }
        }
        self.connection.close().await;
        info!("🛑 Broker subscriber stopped");
    }

    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let subscriptions = self.subscriptions.lock().await;
        let mut infos = Vec::with_capacity(subscriptions.len());
        for ((subject, queue_group), subscription) in subscriptions.iter() {
            infos.push(SubscriptionInfo {
                subject: subject.clone(),
                queue_group: queue_group.clone(),
                handlers: subscription.handlers.read().await.len(),
            });
        }
        infos.sort_by(|a, b| a.subject.cmp(&b.subject).then_with(|| a.queue_group.cmp(&b.queue_group)));
        infos
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for BrokerSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerSubscriber")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
