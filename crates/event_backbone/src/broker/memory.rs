use super::{BrokerConnection, BrokerMessage, BrokerSubscription};
use crate::error::{EventError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

/// NATS-style subject match: `*` matches exactly one token, a trailing `>`
/// matches one or more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match token {
            ">" => return subject_tokens.next().is_some(),
            "*" => {
                if subject_tokens.next().is_none() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    subject_tokens.next().is_none()
}

struct SubscriptionEntry {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::Sender<BrokerMessage>,
}

/// Process-local broker.
///
/// Plain subscribers all receive every matching message; members of a queue
/// group receive them round-robin. A subscriber that falls behind by more
/// than the subscription buffer loses messages, like a slow NATS consumer.
pub struct InMemoryBroker {
    subscriptions: RwLock<Vec<SubscriptionEntry>>,
    next_id: AtomicU64,
    group_cursors: DashMap<String, usize>,
    connected: AtomicBool,
    buffer: usize,
    published: AtomicU64,
    injected_failures: AtomicU32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_SUBSCRIPTION_BUFFER)
    }

    /// A broker whose subscriptions buffer up to `buffer` undelivered messages each.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            group_cursors: DashMap::new(),
            connected: AtomicBool::new(true),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            injected_failures: AtomicU32::new(0),
        }
    }

    /// Makes the next `count` publishes fail with `BrokerUnavailable`.
    pub fn fail_next_publishes(&self, count: u32) {
        self.injected_failures.store(count, Ordering::SeqCst);
    }

    /// Simulates losing the connection without dropping subscriptions.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        warn!("🔌 In-memory broker disconnected");
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        info!("🔌 In-memory broker reconnected");
    }

    /// Messages accepted so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventError::BrokerUnavailable("not connected".into()))
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Delivers `message` and returns how many subscriptions received it.
    async fn route(&self, message: BrokerMessage) -> Result<usize> {
        self.ensure_connected()?;
        if self.take_injected_failure() {
            return Err(EventError::BrokerUnavailable("injected publish failure".into()));
        }
        self.published.fetch_add(1, Ordering::SeqCst);

        let mut targets = Vec::new();
        {
            let subscriptions = self.subscriptions.read().await;
            let mut groups: HashMap<&str, Vec<&SubscriptionEntry>> = HashMap::new();
            for entry in subscriptions.iter() {
                if !subject_matches(&entry.pattern, &message.subject) {
                    continue;
                }
                match &entry.queue_group {
                    Some(group) => groups.entry(group.as_str()).or_default().push(entry),
                    None => targets.push((entry.id, entry.sender.clone())),
                }
            }
            for (group, members) in groups {
                let mut cursor = self.group_cursors.entry(group.to_string()).or_insert(0);
                let member = members[*cursor % members.len()];
                *cursor = cursor.wrapping_add(1);
                targets.push((member.id, member.sender.clone()));
            }
        }

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("⚠️ Slow consumer on subscription {}: dropped message for {}", id, message.subject);
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }
        if !closed.is_empty() {
            self.subscriptions.write().await.retain(|entry| !closed.contains(&entry.id));
            debug!("Pruned {} closed subscriptions", closed.len());
        }
        Ok(delivered)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .field("published", &self.published_count())
            .finish()
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<()> {
        self.route(message).await.map(|_| ())
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_connected()
    }

    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<BrokerSubscription> {
        self.ensure_connected()?;
        if subject.is_empty() {
            return Err(EventError::InvalidConfig("subject must not be empty".into()));
        }
        let (sender, receiver) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.write().await.push(SubscriptionEntry {
            id,
            pattern: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });
        debug!("📝 Broker subscription {} on {} (group {:?})", id, subject, queue_group);
        Ok(BrokerSubscription {
            id,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
            receiver,
        })
    }

    async fn unsubscribe(&self, id: u64) -> Result<()> {
        self.subscriptions.write().await.retain(|entry| entry.id != id);
        Ok(())
    }

    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<BrokerMessage> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut subscription = self.subscribe(&inbox, None).await?;

        let routed = self.route(BrokerMessage::new(subject, payload).with_reply(inbox)).await;
        let outcome = match routed {
            Err(e) => Err(e),
            Ok(0) => Err(EventError::BrokerUnavailable(format!("no responders for {}", subject))),
            Ok(_) => match tokio::time::timeout(timeout, subscription.receiver.recv()).await {
                Ok(Some(reply)) => Ok(reply),
                Ok(None) => Err(EventError::BrokerUnavailable("connection closed".into())),
                Err(_) => Err(EventError::Timeout(timeout.as_millis() as u64)),
            },
        };

        self.unsubscribe(subscription.id).await?;
        outcome
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let dropped = std::mem::take(&mut *self.subscriptions.write().await).len();
        info!("🛑 In-memory broker closed ({} subscriptions dropped)", dropped);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        assert!(subject_matches("game.events.player.login", "game.events.player.login"));
        assert!(subject_matches("game.events.*.login", "game.events.player.login"));
        assert!(subject_matches("game.events.>", "game.events.player.player.login"));
        assert!(!subject_matches("game.events.>", "game.events"));
        assert!(!subject_matches("game.*", "game.events.player"));
        assert!(!subject_matches("game.events.player", "game.events"));
    }

    #[tokio::test]
    async fn test_fan_out_and_queue_groups() {
        let broker = InMemoryBroker::new();
        let mut plain = broker.subscribe("game.>", None).await.unwrap();
        let mut worker_a = broker.subscribe("game.chat", Some("workers")).await.unwrap();
        let mut worker_b = broker.subscribe("game.chat", Some("workers")).await.unwrap();

        for i in 0..4u8 {
            broker.publish(BrokerMessage::new("game.chat", vec![i])).await.unwrap();
        }

        let mut plain_seen = 0;
        while plain.receiver.try_recv().is_ok() {
            plain_seen += 1;
        }
        let mut a_seen = 0;
        while worker_a.receiver.try_recv().is_ok() {
            a_seen += 1;
        }
        let mut b_seen = 0;
        while worker_b.receiver.try_recv().is_ok() {
            b_seen += 1;
        }
        assert_eq!(plain_seen, 4);
        assert_eq!((a_seen, b_seen), (2, 2));
    }

    #[tokio::test]
    async fn test_request_reply() {
        let broker = std::sync::Arc::new(InMemoryBroker::new());
        let mut responder = broker.subscribe("game.rpc.echo", None).await.unwrap();
        let b = broker.clone();
        tokio::spawn(async move {
            if let Some(request) = responder.receiver.recv().await {
                let reply = request.reply.clone().unwrap();
                b.publish(BrokerMessage::new(reply, request.payload)).await.unwrap();
            }
        });

        let reply = broker
            .request("game.rpc.echo", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, b"ping");
        // the reply inbox is gone, only the responder remains
        assert_eq!(broker.subscription_count().await, 1);

        assert!(matches!(
            broker.request("game.rpc.nobody", vec![], Duration::from_millis(50)).await,
            Err(EventError::BrokerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_disconnect_and_injected_failures() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        assert!(broker.publish(BrokerMessage::new("a", vec![])).await.is_err());
        broker.publish(BrokerMessage::new("a", vec![])).await.unwrap();

        broker.disconnect();
        assert!(!broker.is_connected());
        assert!(matches!(broker.flush().await, Err(EventError::BrokerUnavailable(_))));
        broker.reconnect();

        let subscription = broker.subscribe("a", None).await.unwrap();
        drop(subscription);
        broker.publish(BrokerMessage::new("a", vec![])).await.unwrap();
        assert_eq!(broker.subscription_count().await, 0);
        assert_eq!(broker.published_count(), 2);
    }
}
