//! In-process event bus.
//!
//! The bus maps event types to ordered handler lists and fans each published
//! event out to every matching handler concurrently. Handler errors are never
//! swallowed: `publish` waits for all handlers and returns a single
//! [`EventError::HandlerFailed`] listing every failure.
//!
//! Handlers of the same event are independent; no execution order between
//! them is guaranteed.

use crate::envelope::EventEnvelope;
use crate::error::{EventError, HandlerFailure, Result};
use crate::handler::EventHandler;
use crate::stats::BusStats;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Synchronous, in-process publish/subscribe keyed by event type.
pub struct EventBus {
    /// Map of event types to their registered handlers
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
    /// Bus statistics for monitoring
    stats: RwLock<BusStats>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &"[handlers]")
            .field("stats", &"[stats]")
            .finish()
    }
}

impl EventBus {
    /// Creates a bus with no registered handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stats: RwLock::new(BusStats::default()),
        }
    }

    /// Registers `handler` for every event type it accepts.
    ///
    /// Registration is all-or-nothing: if any `(type, name)` pair already
    /// exists the call fails with [`EventError::DuplicateHandler`] and the
    /// registry is left untouched.
    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<()> {
        let name = handler.handler_name().to_string();
        let types = handler.accepted_types();
        if types.is_empty() {
            return Err(EventError::InvalidConfig(format!(
                "handler '{}' accepts no event types",
                name
            )));
        }

        let mut handlers = self.handlers.write().await;
        for event_type in &types {
            let taken = handlers
                .get(event_type)
                .map(|list| list.iter().any(|h| h.handler_name() == name))
                .unwrap_or(false);
            if taken {
                return Err(EventError::DuplicateHandler {
                    event_type: event_type.clone(),
                    handler: name,
                });
            }
        }

        for event_type in &types {
            handlers
                .entry(event_type.clone())
                .or_default()
                .push(handler.clone());
        }
        drop(handlers);

        self.stats.write().await.handlers_registered += types.len();
        info!("📝 Registered handler '{}' for {:?}", name, types);
        Ok(())
    }

    /// Removes the registration of `handler_name` for `event_type`.
    pub async fn unsubscribe(&self, handler_name: &str, event_type: &str) -> Result<()> {
        let mut handlers = self.handlers.write().await;
        let not_found = || EventError::HandlerNotFound {
            event_type: event_type.to_string(),
            handler: handler_name.to_string(),
        };

        let list = handlers.get_mut(event_type).ok_or_else(not_found)?;
        let position = list
            .iter()
            .position(|h| h.handler_name() == handler_name)
            .ok_or_else(not_found)?;
        list.remove(position);
        if list.is_empty() {
            handlers.remove(event_type);
        }
        drop(handlers);

        let mut stats = self.stats.write().await;
        stats.handlers_registered = stats.handlers_registered.saturating_sub(1);
        info!("🗑️ Unregistered handler '{}' from '{}'", handler_name, event_type);
        Ok(())
    }

    /// Delivers `event` to every handler registered for its type and waits for all of them.
    ///
    /// An event nobody listens to is not an error.
    pub async fn publish(&self, ctx: &CancellationToken, event: &EventEnvelope) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(EventError::Cancelled);
        }

        // Clone the handler list so no lock is held while user code runs
        let event_handlers = {
            let handlers = self.handlers.read().await;
            handlers.get(&event.event_type).cloned()
        };

        let Some(event_handlers) = event_handlers else {
            debug!("No handlers for event: {}", event.event_type);
            let mut stats = self.stats.write().await;
            stats.events_published += 1;
            stats.unobserved_events += 1;
            return Ok(());
        };

        debug!("📤 Publishing {} to {} handlers", event.event_type, event_handlers.len());

        let mut futures = FuturesUnordered::new();
        for handler in event_handlers.iter() {
            let handler = handler.clone();
            futures.push(async move {
                let started = Instant::now();
                let outcome = handler.handle(ctx, event).await;
                (handler.handler_name().to_string(), started.elapsed(), outcome)
            });
        }

        let mut outcomes: Vec<(String, Duration, Result<()>)> = Vec::with_capacity(event_handlers.len());
        while let Some(outcome) = futures.next().await {
            outcomes.push(outcome);
        }

        let mut failures = Vec::new();
        {
            let mut stats = self.stats.write().await;
            stats.events_published += 1;
            for (name, elapsed, outcome) in &outcomes {
                let success = outcome.is_ok();
                if success {
                    stats.events_handled += 1;
                } else {
                    stats.handler_failures += 1;
                }
                stats.by_handler.entry(name.clone()).or_default().record(*elapsed, success);
            }
        }

        for (name, _, outcome) in outcomes {
            if let Err(e) = outcome {
                error!("❌ Handler {} failed on {}: {}", name, event.event_type, e);
                failures.push(HandlerFailure { handler: name, message: e.to_string() });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventError::HandlerFailed(failures))
        }
    }

    /// Fire-and-forget variant of [`publish`](Self::publish).
    ///
    /// Returns immediately; failures only show up in logs and statistics.
    pub fn publish_async(self: &Arc<Self>, ctx: &CancellationToken, event: EventEnvelope) {
        let bus = Arc::clone(self);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = bus.publish(&ctx, &event).await {
                warn!("⚠️ Async publish of {} ({}) failed: {}", event.event_type, event.id, e);
            }
        });
    }

    /// Gets all event types with at least one handler.
    pub async fn registered_types(&self) -> Vec<String> {
        let handlers = self.handlers.read().await;
        handlers.keys().cloned().collect()
    }

    /// Gets the number of handlers registered for `event_type`.
    pub async fn handler_count(&self, event_type: &str) -> usize {
        let handlers = self.handlers.read().await;
        handlers.get(event_type).map(|h| h.len()).unwrap_or(0)
    }

    /// Gets a copy of the current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Clears counters; registrations are kept.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        let handlers_registered = stats.handlers_registered;
        *stats = BusStats {
            handlers_registered,
            ..BusStats::default()
        };
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::FnHandler;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(name: &str, types: &[&str], counter: Arc<AtomicUsize>) -> Arc<dyn EventHandler> {
        FnHandler::new(name, types.iter().copied(), move |_ctx, _event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .shared()
    }

    fn event(event_type: &str) -> EventEnvelope {
        EventEnvelope::new(event_type, "player", "p-1", json!({}))
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_handlers() {
        let bus = EventBus::new();
        let login = Arc::new(AtomicUsize::new(0));
        let both = Arc::new(AtomicUsize::new(0));
        let battle = Arc::new(AtomicUsize::new(0));

        bus.subscribe(counting_handler("login", &["player.login"], login.clone())).await.unwrap();
        bus.subscribe(counting_handler("both", &["player.login", "battle.started"], both.clone())).await.unwrap();
        bus.subscribe(counting_handler("battle", &["battle.started"], battle.clone())).await.unwrap();

        let ctx = CancellationToken::new();
        bus.publish(&ctx, &event("player.login")).await.unwrap();

        assert_eq!(login.load(Ordering::SeqCst), 1);
        assert_eq!(both.load(Ordering::SeqCst), 1);
        assert_eq!(battle.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_leaves_state_unchanged() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler("audit", &["player.login"], counter.clone())).await.unwrap();

        let err = bus
            .subscribe(counting_handler("audit", &["player.logout", "player.login"], counter.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::DuplicateHandler { .. }));
        assert_eq!(bus.handler_count("player.login").await, 1);
        assert_eq!(bus.handler_count("player.logout").await, 0);
        assert_eq!(bus.get_stats().await.handlers_registered, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_handler() {
        let bus = EventBus::new();
        let err = bus.unsubscribe("ghost", "player.login").await.unwrap_err();
        assert!(matches!(err, EventError::HandlerNotFound { .. }));
    }

    #[tokio::test]
    async fn test_publish_without_handlers_is_ok() {
        let bus = EventBus::new();
        bus.publish(&CancellationToken::new(), &event("nobody.cares")).await.unwrap();
        let stats = bus.get_stats().await;
        assert_eq!(stats.events_published, 1);
        assert_eq!(stats.unobserved_events, 1);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated_and_successes_counted() {
        let bus = EventBus::new();
        let ok = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler("ok", &["battle.ended"], ok.clone())).await.unwrap();
        for name in ["bad_a", "bad_b"] {
            bus.subscribe(
                FnHandler::new(name, ["battle.ended"], |_ctx, _event| async {
                    Err(EventError::HandlerExecution("db down".into()))
                })
                .shared(),
            )
            .await
            .unwrap();
        }

        let err = bus.publish(&CancellationToken::new(), &event("battle.ended")).await.unwrap_err();
        match err {
            EventError::HandlerFailed(failures) => {
                let mut names: Vec<_> = failures.iter().map(|f| f.handler.as_str()).collect();
                names.sort();
                assert_eq!(names, vec!["bad_a", "bad_b"]);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        assert_eq!(ok.load(Ordering::SeqCst), 1);
        let stats = bus.get_stats().await;
        assert_eq!(stats.events_handled, 1);
        assert_eq!(stats.handler_failures, 2);
        assert_eq!(stats.by_handler["bad_a"].failed_count, 1);
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let bus = EventBus::new();
        for name in ["slow_a", "slow_b", "slow_c"] {
            bus.subscribe(
                FnHandler::new(name, ["instance.tick"], |_ctx, _event| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .shared(),
            )
            .await
            .unwrap();
        }

        let started = Instant::now();
        bus.publish(&CancellationToken::new(), &event("instance.tick")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_publish_async_returns_immediately() {
        let bus = Arc::new(EventBus::new());
        let counter = Arc::new(AtomicUsize::new(0));
        bus.subscribe(counting_handler("async", &["player.login"], counter.clone())).await.unwrap();

        bus.publish_async(&CancellationToken::new(), event("player.login"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_context_is_rejected() {
        let bus = EventBus::new();
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(bus.publish(&ctx, &event("player.login")).await, Err(EventError::Cancelled));
    }
}
