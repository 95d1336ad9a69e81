use super::{BrokerConnection, BrokerMessage};
use crate::config::BrokerConfig;
use crate::envelope::EventEnvelope;
use crate::error::{BatchFailure, EventError, Result};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Publishes envelopes and raw payloads to the broker.
///
/// Every publish is attempted up to `publish_attempts` times with a fixed
/// pause in between; only the last error reaches the caller.
pub struct BrokerPublisher {
    connection: Arc<dyn BrokerConnection>,
    config: BrokerConfig,
}

impl BrokerPublisher {
    pub fn new(connection: Arc<dyn BrokerConnection>, config: BrokerConfig) -> Self {
        Self { connection, config }
    }

    /// Subject an envelope is published under.
    pub fn subject_for(&self, event: &EventEnvelope) -> String {
        event.subject(&self.config.subject_prefix)
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Serializes `event` to the JSON wire format and publishes it.
    pub async fn publish_event(&self, event: &EventEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.publish_message(&self.subject_for(event), payload).await
    }

    /// Publishes a raw payload to `subject`.
    pub async fn publish_message(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        let attempts = self.config.publish_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.connection.publish(BrokerMessage::new(subject, payload.clone())).await {
                Ok(()) => {
                    debug!("📤 Published to {} ({} bytes)", subject, payload.len());
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!("⚠️ Publish to {} failed (attempt {}/{}): {}", subject, attempt, attempts, e);
                    tokio::time::sleep(self.config.publish_retry_delay()).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("❌ Publish to {} failed after {} attempts: {}", subject, attempts, e);
                    return Err(e);
                }
            }
        }
    }

    /// Publishes every `(subject, payload)` pair, then flushes once.
    ///
    /// Returns one outcome per input, in order. A failed flush is reported on
    /// every item that had been sent.
    pub async fn publish_each(&self, messages: Vec<(String, Vec<u8>)>) -> Vec<Result<()>> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for (subject, payload) in messages {
            outcomes.push(self.publish_message(&subject, payload).await);
        }

        if outcomes.iter().any(Result::is_ok) {
            if let Err(e) = self.connection.flush().await {
                error!("❌ Flush after batch publish failed: {}", e);
                for outcome in outcomes.iter_mut().filter(|o| o.is_ok()) {
                    *outcome = Err(e.clone());
                }
            }
        }
        outcomes
    }

    /// Batch publish with a single aggregated error.
    ///
    /// Messages that went out before a failure are not retracted.
    pub async fn publish_batch(&self, messages: Vec<(String, Vec<u8>)>) -> Result<()> {
        let subjects: Vec<String> = messages.iter().map(|(subject, _)| subject.clone()).collect();
        let failures: Vec<BatchFailure> = subjects
            .into_iter()
            .zip(self.publish_each(messages).await)
            .filter_map(|(subject, outcome)| {
                outcome.err().map(|e| BatchFailure { subject, message: e.to_string() })
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventError::BatchFailed(failures))
        }
    }

    /// Request/reply with the configured timeout.
    pub async fn request(&self, subject: &str, payload: Vec<u8>) -> Result<BrokerMessage> {
        self.connection
            .request(subject, payload, self.config.request_timeout())
            .await
    }
}

impl std::fmt::Debug for BrokerPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerPublisher")
            .field("subject_prefix", &self.config.subject_prefix)
            .field("connected", &self.is_connected())
            .finish()
    }
}
