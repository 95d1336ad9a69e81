//! Bridge between local events and an external pub/sub broker.
//!
//! [`BrokerConnection`] is the boundary to the broker itself. The crate ships
//! [`InMemoryBroker`], a process-local implementation with NATS-style subject
//! semantics, used by the host binary and the test-suite. On top of a
//! connection sit:
//!
//! - [`BrokerPublisher`]: serializes envelopes and publishes them with a
//!   bounded number of attempts.
//! - [`BrokerSubscriber`]: registers handlers for subjects (optionally in a
//!   queue group) and dead-letters messages whose handlers keep failing.
//!
//! Subjects follow `{prefix}.events.{aggregate_type}.{event_type}`.

mod memory;
mod publisher;
mod subscriber;

pub use memory::{subject_matches, InMemoryBroker};
pub use publisher::BrokerPublisher;
pub use subscriber::{BrokerSubscriber, MessageHandler, SubscriptionInfo};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message as carried by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Inbox to answer to, for request/reply
    pub reply: Option<String>,
}

impl BrokerMessage {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            subject: subject.into(),
            payload,
            reply: None,
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }
}

/// A live subscription handed out by [`BrokerConnection::subscribe`].
///
/// Messages arrive on `receiver`; dropping it (or calling
/// [`BrokerConnection::unsubscribe`] with `id`) ends the subscription.
#[derive(Debug)]
pub struct BrokerSubscription {
    pub id: u64,
    pub subject: String,
    pub queue_group: Option<String>,
    pub receiver: mpsc::Receiver<BrokerMessage>,
}

/// Connection to an external broker.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Sends one message. Fails with `BrokerUnavailable` when disconnected.
    async fn publish(&self, message: BrokerMessage) -> Result<()>;

    /// Waits until every previously published message has been handed to the broker.
    async fn flush(&self) -> Result<()>;

    /// Subscribes to `subject`, which may contain `*` and `>` wildcards.
    /// Members of the same `queue_group` share delivery: each message reaches one of them.
    async fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> Result<BrokerSubscription>;

    /// Removes a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, id: u64) -> Result<()>;

    /// Publishes `payload` with a private reply inbox and waits up to `timeout` for the answer.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration) -> Result<BrokerMessage>;

    /// Drops every subscription and refuses further traffic.
    async fn close(&self);

    fn is_connected(&self) -> bool;
}
