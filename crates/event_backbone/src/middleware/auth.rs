use super::{Middleware, Next};
use crate::envelope::EventEnvelope;
use crate::error::{EventError, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const SYSTEM_NAMESPACE: &str = "system.";
const SYSTEM_EVENTS: [&str; 3] = ["health", "start", "stop"];

/// Whether `event_type` is a server-originated lifecycle event
/// (`system.health`, `system.start`, `system.stop`, or a deeper
/// `system.*.health` style name).
pub fn is_system_event(event_type: &str) -> bool {
    event_type.starts_with(SYSTEM_NAMESPACE)
        && event_type
            .rsplit('.')
            .next()
            .map(|last| SYSTEM_EVENTS.contains(&last))
            .unwrap_or(false)
}

/// Requires a non-empty actor identity on every non-system event.
#[derive(Debug, Default)]
pub struct AuthenticationMiddleware;

impl AuthenticationMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for AuthenticationMiddleware {
    fn name(&self) -> &str {
        "authentication"
    }

    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()> {
        if !is_system_event(&event.event_type) && event.actor().is_none() {
            return Err(EventError::Unauthenticated(format!(
                "{} ({}) carries no actor",
                event.event_type, event.id
            )));
        }
        next.run(ctx, event).await
    }
}
