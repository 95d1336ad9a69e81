//! Event handler capability.
//!
//! A handler declares a stable name and the set of event types it accepts;
//! the [`EventBus`](crate::bus::EventBus) registers it once per accepted type.
//! Closures can be registered through [`FnHandler`] without writing a struct.

use crate::envelope::EventEnvelope;
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Trait implemented by every consumer of events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Implementations should observe `ctx` for cancellation
    /// when they perform long-running work.
    async fn handle(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()>;

    /// Stable name, used to reject duplicate registrations and for statistics.
    fn handler_name(&self) -> &str;

    /// Event types this handler wants to receive.
    fn accepted_types(&self) -> Vec<String>;
}

type HandlerFn =
    dyn Fn(CancellationToken, Arc<EventEnvelope>) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Closure-backed handler.
///
/// ```rust
/// use event_backbone::FnHandler;
///
/// let handler = FnHandler::new("login_audit", ["player.login"], |_ctx, event| async move {
///     tracing::info!("player {} logged in", event.aggregate_id);
///     Ok(())
/// });
/// ```
pub struct FnHandler {
    name: String,
    types: Vec<String>,
    func: Box<HandlerFn>,
}

impl FnHandler {
    pub fn new<I, S, F, Fut>(name: impl Into<String>, types: I, func: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(CancellationToken, Arc<EventEnvelope>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            types: types.into_iter().map(Into::into).collect(),
            func: Box::new(move |ctx, event| Box::pin(func(ctx, event))),
        }
    }

    /// Wraps the handler in an `Arc` ready for [`EventBus::subscribe`](crate::bus::EventBus::subscribe).
    pub fn shared(self) -> Arc<dyn EventHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()> {
        (self.func)(ctx.clone(), Arc::new(event.clone())).await
    }

    fn handler_name(&self) -> &str {
        &self.name
    }

    fn accepted_types(&self) -> Vec<String> {
        self.types.clone()
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("name", &self.name)
            .field("types", &self.types)
            .finish()
    }
}
