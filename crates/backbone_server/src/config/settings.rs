//! Configuration settings structures
//!
//! The file layout is one TOML table per concern. Engine tables
//! (`[dispatcher]`, `[middleware]`, `[broker]`) map directly onto
//! [`EngineConfig`]; every field has a default, so partial files are fine.

use event_backbone::{BrokerConfig, DispatcherConfig, EngineConfig, MiddlewareConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
///
/// Root object of the TOML configuration file.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity and housekeeping of this node
    pub node: NodeSettings,
    /// Queue, worker pool and retry settings
    pub dispatcher: DispatcherConfig,
    /// Rate limit and circuit breaker settings
    pub middleware: MiddlewareConfig,
    /// Broker subjects and publish retries
    pub broker: BrokerConfig,
    /// Logging output configuration
    pub logging: LoggingSettings,
}

impl Config {
    /// Engine part of the configuration.
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            dispatcher: self.dispatcher.clone(),
            middleware: self.middleware.clone(),
            broker: self.broker.clone(),
        }
    }
}

/// Node settings
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NodeSettings {
    /// Name used as aggregate id of this node's system events
    pub name: String,

    /// Interval between `system.health` heartbeats in milliseconds
    ///
    /// `0` disables the heartbeat.
    pub heartbeat_interval_ms: u64,
}

impl NodeSettings {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_ms > 0).then(|| Duration::from_millis(self.heartbeat_interval_ms))
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: "backbone-1".to_string(),
            heartbeat_interval_ms: 5000,
        }
    }
}

/// Logging system configuration
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level filter
    ///
    /// Valid values: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Enable JSON-formatted log output
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}
