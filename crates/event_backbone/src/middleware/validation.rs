use super::{Middleware, Next};
use crate::envelope::EventEnvelope;
use crate::error::{EventError, Result};
use crate::utils::current_timestamp_millis;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How far in the future an event timestamp may lie.
pub const MAX_FUTURE_SKEW: Duration = Duration::from_secs(5 * 60);
/// How old an event may be.
pub const MAX_EVENT_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Rejects malformed envelopes with [`EventError::InvalidEvent`].
#[derive(Debug, Default)]
pub struct ValidationMiddleware;

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self
    }

    /// Checks an envelope against the clock reading `now_ms`.
    pub fn validate_at(event: &EventEnvelope, now_ms: u64) -> Result<()> {
        if event.id.trim().is_empty() {
            return Err(EventError::InvalidEvent("event id is empty".into()));
        }
        if event.event_type.trim().is_empty() {
            return Err(EventError::InvalidEvent(format!("event {} has no type", event.id)));
        }
        if event.occurred_at == 0 {
            return Err(EventError::InvalidEvent(format!("event {} has no timestamp", event.id)));
        }

        let skew = MAX_FUTURE_SKEW.as_millis() as u64;
        if event.occurred_at > now_ms.saturating_add(skew) {
            return Err(EventError::InvalidEvent(format!(
                "event {} timestamp is {} ms in the future",
                event.id,
                event.occurred_at - now_ms
            )));
        }

        let max_age = MAX_EVENT_AGE.as_millis() as u64;
        if now_ms.saturating_sub(event.occurred_at) > max_age {
            return Err(EventError::InvalidEvent(format!(
                "event {} is older than {} hours",
                event.id,
                MAX_EVENT_AGE.as_secs() / 3600
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()> {
        Self::validate_at(event, current_timestamp_millis())?;
        next.run(ctx, event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: u64 = 1_700_000_000_000;

    fn event() -> EventEnvelope {
        EventEnvelope::new("battle.started", "battle", "b-1", json!({})).with_occurred_at(NOW)
    }

    #[test]
    fn test_accepts_current_event() {
        assert!(ValidationMiddleware::validate_at(&event(), NOW).is_ok());
    }

    #[test]
    fn test_rejects_missing_fields() {
        for broken in [
            event().with_id(""),
            EventEnvelope { event_type: String::new(), ..event() },
            event().with_occurred_at(0),
        ] {
            assert!(matches!(
                ValidationMiddleware::validate_at(&broken, NOW),
                Err(EventError::InvalidEvent(_))
            ));
        }
    }

    #[test]
    fn test_future_and_past_bounds() {
        let minute = 60_000;
        assert!(ValidationMiddleware::validate_at(&event().with_occurred_at(NOW + 4 * minute), NOW).is_ok());
        assert!(ValidationMiddleware::validate_at(&event().with_occurred_at(NOW + 6 * minute), NOW).is_err());

        let hour = 60 * minute;
        assert!(ValidationMiddleware::validate_at(&event().with_occurred_at(NOW - 23 * hour), NOW).is_ok());
        assert!(ValidationMiddleware::validate_at(&event().with_occurred_at(NOW - 25 * hour), NOW).is_err());
    }
}
