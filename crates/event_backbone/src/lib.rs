//! # Event Backbone
//!
//! The event dispatch and delivery engine of the game server. It decouples
//! producers of domain events (player actions, battle outcomes, instance
//! lifecycle changes) from the consumers that react to them, while tolerating
//! slow or failing consumers, bursty load and an unreliable broker.
//!
//! ## Core Features
//!
//! - **In-process bus**: concurrent fan-out to every handler of an event type,
//!   with all handler errors aggregated into one
//! - **Async dispatch**: bounded queue, batching, linear-backoff retries and
//!   dead-lettering on top of a fixed-size worker pool
//! - **Middleware**: validation, authentication, per-actor rate limiting,
//!   per-type circuit breaking and metrics around every delivery
//! - **Broker bridge**: publish/subscribe, queue groups and request/reply over
//!   any [`BrokerConnection`]
//! - **Statistics**: per event type, per handler and per worker
//!
//! ## Architecture Overview
//!
//! ```text
//! producer ─▶ EventDispatcher ─▶ queue ─▶ WorkerPool ─▶ MiddlewareChain ─▶ EventBus ─▶ handlers
//!                                                                     └──▶ BrokerPublisher ─▶ broker
//! broker ─▶ BrokerSubscriber ─▶ handlers / EventBus
//! ```
//!
//! Delivery is at-least-once within the process, with a bounded number of
//! attempts per event. Nothing is persisted across restarts.
//!
//! ## Quick Start Example
//!
//! ```rust
//! use event_backbone::*;
//! use serde_json::json;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<()> {
//! let bus = Arc::new(EventBus::new());
//! bus.subscribe(
//!     FnHandler::new("welcome", ["player.login"], |_ctx, event| async move {
//!         tracing::info!("welcome back {}", event.aggregate_id);
//!         Ok(())
//!     })
//!     .shared(),
//! )
//! .await?;
//!
//! let config = EngineConfig::default();
//! let dispatcher = EventDispatcher::builder(config.dispatcher.clone(), bus)
//!     .middleware(MiddlewareChain::standard(&config.middleware))
//!     .build()?;
//!
//! let ctx = CancellationToken::new();
//! dispatcher.start(&ctx).await?;
//!
//! let login = EventEnvelope::new("player.login", "player", "p-1", json!({"zone": 3})).with_actor("p-1");
//! dispatcher.dispatch_async(&ctx, login).await?;
//!
//! dispatcher.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod pool;
pub mod stats;
pub mod utils;

pub use broker::{
    BrokerConnection, BrokerMessage, BrokerPublisher, BrokerSubscriber, BrokerSubscription, InMemoryBroker,
    MessageHandler, SubscriptionInfo,
};
pub use bus::EventBus;
pub use config::{BrokerConfig, DispatcherConfig, EngineConfig, MiddlewareConfig};
pub use dispatcher::{DispatcherBuilder, EventDispatcher};
pub use envelope::{DeadLetterRecord, EventEnvelope, QueuedMessage, ACTOR_METADATA_KEY};
pub use error::{BatchFailure, EventError, HandlerFailure, Result};
pub use handler::{EventHandler, FnHandler};
pub use middleware::{
    AuthenticationMiddleware, CircuitBreaker, CircuitBreakerMiddleware, CircuitState, Endpoint, Middleware,
    MetricsMiddleware, MiddlewareChain, Next, RateLimitMiddleware, TokenBucket, ValidationMiddleware,
};
pub use pool::{Processor, WorkerPool};
pub use stats::{BusStats, DispatcherStats, EventTypeStats, HandlerStats, PoolStats, WorkerStats};
pub use utils::{current_timestamp, current_timestamp_millis};
