//! Engine configuration.
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs the values it wants to change. Durations are given in
//! milliseconds.
//!
//! ```toml
//! [dispatcher]
//! worker_count = 8
//! queue_size = 4096
//! max_retries = 3
//!
//! [middleware]
//! rate_limit_capacity = 20
//! rate_limit_refill_per_sec = 5.0
//!
//! [broker]
//! subject_prefix = "game"
//! ```

use crate::error::{EventError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the event backbone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub middleware: MiddlewareConfig,
    pub broker: BrokerConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.dispatcher.validate()?;
        self.middleware.validate()?;
        self.broker.validate()
    }
}

/// Queue, worker pool, batching and retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of pool workers
    pub worker_count: usize,
    /// Capacity of the dispatch queue and of the pool queue
    pub queue_size: usize,
    /// Messages handed to the pool per flush
    pub batch_size: usize,
    /// Longest a partial batch waits before being flushed
    pub batch_timeout_ms: u64,
    /// Extra attempts after the first failure
    pub max_retries: u32,
    /// Base of the linear retry backoff (`retry_delay * retry_count`)
    pub retry_delay_ms: u64,
    /// Deadline for a single processing attempt
    pub max_processing_time_ms: u64,
    pub enable_dead_letter: bool,
    pub dead_letter_subject: String,
    /// Entries kept in the in-memory dead-letter log
    pub dead_letter_capacity: usize,
    /// Period of the stats summary log line
    pub metrics_interval_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            queue_size: 1024,
            batch_size: 32,
            batch_timeout_ms: 100,
            max_retries: 3,
            retry_delay_ms: 1000,
            max_processing_time_ms: 30_000,
            enable_dead_letter: true,
            dead_letter_subject: "game.dead_letter".to_string(),
            dead_letter_capacity: 1000,
            metrics_interval_ms: 60_000,
        }
    }
}

impl DispatcherConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(EventError::InvalidConfig("dispatcher.worker_count must be > 0".into()));
        }
        if self.queue_size == 0 {
            return Err(EventError::InvalidConfig("dispatcher.queue_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(EventError::InvalidConfig("dispatcher.batch_size must be > 0".into()));
        }
        if self.batch_timeout_ms == 0 {
            return Err(EventError::InvalidConfig("dispatcher.batch_timeout_ms must be > 0".into()));
        }
        if self.max_processing_time_ms == 0 {
            return Err(EventError::InvalidConfig("dispatcher.max_processing_time_ms must be > 0".into()));
        }
        if self.metrics_interval_ms == 0 {
            return Err(EventError::InvalidConfig("dispatcher.metrics_interval_ms must be > 0".into()));
        }
        if self.enable_dead_letter && self.dead_letter_subject.trim().is_empty() {
            return Err(EventError::InvalidConfig(
                "dispatcher.dead_letter_subject is required when dead-lettering is enabled".into(),
            ));
        }
        Ok(())
    }
}

/// Rate limit and circuit breaker settings for the standard middleware chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Token bucket size per actor
    pub rate_limit_capacity: u32,
    /// Tokens added per second per actor
    pub rate_limit_refill_per_sec: f64,
    /// Consecutive failures that open a circuit
    pub circuit_failure_threshold: u32,
    /// How long an open circuit rejects calls
    pub circuit_timeout_ms: u64,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            rate_limit_capacity: 100,
            rate_limit_refill_per_sec: 10.0,
            circuit_failure_threshold: 5,
            circuit_timeout_ms: 30_000,
        }
    }
}

impl MiddlewareConfig {
    pub fn circuit_timeout(&self) -> Duration {
        Duration::from_millis(self.circuit_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_limit_capacity == 0 {
            return Err(EventError::InvalidConfig("middleware.rate_limit_capacity must be > 0".into()));
        }
        if !self.rate_limit_refill_per_sec.is_finite() || self.rate_limit_refill_per_sec < 0.0 {
            return Err(EventError::InvalidConfig(
                "middleware.rate_limit_refill_per_sec must be a non-negative number".into(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(EventError::InvalidConfig("middleware.circuit_failure_threshold must be > 0".into()));
        }
        Ok(())
    }
}

/// Broker publisher/subscriber settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// First segment of every event subject
    pub subject_prefix: String,
    /// Attempts per publish before the error is surfaced
    pub publish_attempts: u32,
    /// Fixed pause between publish attempts
    pub publish_retry_delay_ms: u64,
    pub request_timeout_ms: u64,
    /// Where inbound messages go after their handlers keep failing
    pub dead_letter_subject: Option<String>,
    /// Extra handler attempts for an inbound message before dead-lettering
    pub handler_retries: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subject_prefix: "game".to_string(),
            publish_attempts: 3,
            publish_retry_delay_ms: 100,
            request_timeout_ms: 5000,
            dead_letter_subject: None,
            handler_retries: 0,
        }
    }
}

impl BrokerConfig {
    pub fn publish_retry_delay(&self) -> Duration {
        Duration::from_millis(self.publish_retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subject_prefix.trim().is_empty() {
            return Err(EventError::InvalidConfig("broker.subject_prefix must not be empty".into()));
        }
        if self.publish_attempts == 0 {
            return Err(EventError::InvalidConfig("broker.publish_attempts must be > 0".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(EventError::InvalidConfig("broker.request_timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert!(config.dispatcher.worker_count >= 1);
        assert_eq!(config.dispatcher.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
[dispatcher]
worker_count = 2
queue_size = 16

[broker]
subject_prefix = "realm1"
dead_letter_subject = "realm1.dlq"
"#,
        )
        .unwrap();

        assert_eq!(config.dispatcher.worker_count, 2);
        assert_eq!(config.dispatcher.queue_size, 16);
        assert_eq!(config.dispatcher.max_retries, 3);
        assert_eq!(config.middleware, MiddlewareConfig::default());
        assert_eq!(config.broker.dead_letter_subject.as_deref(), Some("realm1.dlq"));
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let mut config = EngineConfig::default();
        config.dispatcher.queue_size = 0;
        assert!(matches!(config.validate(), Err(EventError::InvalidConfig(_))));

        let mut config = EngineConfig::default();
        config.dispatcher.dead_letter_subject = "  ".into();
        assert!(config.validate().is_err());
        config.dispatcher.enable_dead_letter = false;
        assert!(config.validate().is_ok());

        let mut config = EngineConfig::default();
        config.middleware.circuit_failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
