//! Middleware chain wrapped around every event on the processing path.
//!
//! Each middleware receives the event plus a [`Next`] handle and decides
//! whether to call further down the chain. The standard chain runs, outermost
//! first:
//!
//! ```text
//! Validation → Authentication → RateLimit → CircuitBreaker → Metrics → endpoint
//! ```
//!
//! Any stage returning an error short-circuits the rest. All middleware state
//! (token buckets, breakers, metric histories) is owned by the middleware
//! instances themselves and lives as long as the chain.

mod auth;
mod circuit_breaker;
mod metrics;
mod rate_limit;
mod validation;

pub use auth::{is_system_event, AuthenticationMiddleware};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerMiddleware, CircuitState};
pub use metrics::{EventTypeMetrics, MetricsMiddleware, MAX_DURATION_SAMPLES};
pub use rate_limit::{RateLimitMiddleware, TokenBucket};
pub use validation::{ValidationMiddleware, MAX_EVENT_AGE, MAX_FUTURE_SKEW};

use crate::config::MiddlewareConfig;
use crate::envelope::EventEnvelope;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The innermost step of the chain, usually the dispatcher's delivery call.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn call(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()>;
}

/// An interceptor around event processing.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Processes `event`, calling `next.run(..)` to continue down the chain.
    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()>;
}

/// The remainder of the chain from the point of view of one middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    /// Invokes the next middleware, or the endpoint once the chain is exhausted.
    pub fn run(self, ctx: &'a CancellationToken, event: &'a EventEnvelope) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    let next = Next { chain: rest, endpoint: self.endpoint };
                    head.process(ctx, event, next).await
                }
                None => self.endpoint.call(ctx, event).await,
            }
        })
    }
}

/// Ordered collection of middleware.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    /// An empty chain: events go straight to the endpoint.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validation → Authentication → RateLimit → CircuitBreaker → Metrics.
    pub fn standard(config: &MiddlewareConfig) -> Self {
        Self::new()
            .with(ValidationMiddleware::new())
            .with(AuthenticationMiddleware::new())
            .with(RateLimitMiddleware::new(config.rate_limit_capacity, config.rate_limit_refill_per_sec))
            .with(CircuitBreakerMiddleware::new(
                config.circuit_failure_threshold,
                config.circuit_timeout(),
            ))
            .with(MetricsMiddleware::new())
    }

    /// Appends a middleware as the new innermost stage.
    pub fn with<M: Middleware + 'static>(self, middleware: M) -> Self {
        self.with_shared(Arc::new(middleware))
    }

    /// Appends an already shared middleware, keeping a handle for inspection.
    pub fn with_shared(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Names in execution order.
    pub fn names(&self) -> Vec<String> {
        self.middlewares.iter().map(|m| m.name().to_string()).collect()
    }

    /// Runs `event` through every middleware and finally `endpoint`.
    pub async fn execute(
        &self,
        ctx: &CancellationToken,
        event: &EventEnvelope,
        endpoint: &dyn Endpoint,
    ) -> Result<()> {
        Next { chain: &self.middlewares, endpoint }.run(ctx, event).await
    }
}

impl std::fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewareChain").field("middlewares", &self.names()).finish()
    }
}
