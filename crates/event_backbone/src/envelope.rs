//! Event envelope and queued-message types.
//!
//! An [`EventEnvelope`] describes one domain event (a player action, a battle
//! outcome, an instance lifecycle change). It is built once by the producer and
//! then shared read-only, usually behind an `Arc`, by every downstream component.
//!
//! The serde representation doubles as the broker wire format:
//!
//! ```json
//! {
//!   "event_id": "…", "event_type": "battle.started",
//!   "aggregate_id": "battle-7", "aggregate_type": "battle",
//!   "version": 3, "timestamp": 1700000000000,
//!   "data": { … }, "metadata": { "actor_id": "player-1" }
//! }
//! ```

use crate::utils::current_timestamp_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Metadata key carrying the identity of the actor (usually a player) behind an event.
pub const ACTOR_METADATA_KEY: &str = "actor_id";

/// Immutable description of a single domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier
    #[serde(rename = "event_id")]
    pub id: String,
    /// Namespaced event type, e.g. `"battle.started"`
    pub event_type: String,
    /// Identifier of the aggregate the event belongs to
    pub aggregate_id: String,
    /// Kind of aggregate, e.g. `"player"` or `"instance"`
    pub aggregate_type: String,
    /// Per-aggregate version; advisory only
    pub version: u64,
    /// When the event happened, Unix milliseconds (`0` means unset)
    #[serde(rename = "timestamp")]
    pub occurred_at: u64,
    /// Event payload
    #[serde(default)]
    pub data: serde_json::Value,
    /// Free-form string metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EventEnvelope {
    /// Creates an envelope with a fresh UUID, version 1 and the current time.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            version: 1,
            occurred_at: current_timestamp_millis(),
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn with_occurred_at(mut self, occurred_at: u64) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attaches the actor identity used by authentication and rate limiting.
    pub fn with_actor(self, actor: impl Into<String>) -> Self {
        self.with_metadata(ACTOR_METADATA_KEY, actor)
    }

    /// Actor identity from metadata, if present and non-empty.
    pub fn actor(&self) -> Option<&str> {
        self.metadata
            .get(ACTOR_METADATA_KEY)
            .map(String::as_str)
            .filter(|actor| !actor.is_empty())
    }

    /// Broker subject for this event: `{prefix}.events.{aggregate_type}.{event_type}`.
    pub fn subject(&self, prefix: &str) -> String {
        format!("{}.events.{}.{}", prefix, self.aggregate_type, self.event_type)
    }
}

/// An envelope travelling through the asynchronous path.
///
/// Only `retry_count` ever changes, and only through [`QueuedMessage::next_attempt`].
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Arc<EventEnvelope>,
    pub enqueued_at: Instant,
    pub retry_count: u32,
}

impl QueuedMessage {
    pub fn new(envelope: Arc<EventEnvelope>) -> Self {
        Self {
            envelope,
            enqueued_at: Instant::now(),
            retry_count: 0,
        }
    }

    /// The same message re-enqueued for another attempt.
    pub fn next_attempt(mut self) -> Self {
        self.retry_count += 1;
        self.enqueued_at = Instant::now();
        self
    }

    pub fn event_type(&self) -> &str {
        &self.envelope.event_type
    }
}

/// Wire payload published to a dead-letter subject.
///
/// ```json
/// { "original_subject": "…", "original_data": { … }, "error": "…",
///   "timestamp": 1700000000000, "retry_count": 3 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub original_subject: String,
    /// The original message; raw payloads that are not JSON are kept as a string
    pub original_data: serde_json::Value,
    pub error: String,
    /// When the message was dead-lettered, Unix milliseconds
    pub timestamp: u64,
    pub retry_count: u32,
}

impl DeadLetterRecord {
    pub fn new(
        original_subject: impl Into<String>,
        original_data: serde_json::Value,
        error: impl std::fmt::Display,
        retry_count: u32,
    ) -> Self {
        Self {
            original_subject: original_subject.into(),
            original_data,
            error: error.to_string(),
            timestamp: current_timestamp_millis(),
            retry_count,
        }
    }

    /// Builds a record from a raw broker payload.
    pub fn from_payload(
        original_subject: impl Into<String>,
        payload: &[u8],
        error: impl std::fmt::Display,
        retry_count: u32,
    ) -> Self {
        let data = serde_json::from_slice(payload)
            .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()));
        Self::new(original_subject, data, error, retry_count)
    }
}
