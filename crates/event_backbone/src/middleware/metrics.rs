use super::{Middleware, Next};
use crate::envelope::EventEnvelope;
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Size of the rolling duration history kept per event type.
pub const MAX_DURATION_SAMPLES: usize = 100;

/// Success/failure counts and recent processing durations for one event type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeMetrics {
    pub success_count: u64,
    pub failure_count: u64,
    /// Most recent durations in microseconds, oldest first
    pub recent_durations_us: VecDeque<u64>,
}

impl EventTypeMetrics {
    fn record(&mut self, elapsed: Duration, success: bool) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        if self.recent_durations_us.len() == MAX_DURATION_SAMPLES {
            self.recent_durations_us.pop_front();
        }
        self.recent_durations_us.push_back(elapsed.as_micros() as u64);
    }

    /// Mean of the recent samples.
    pub fn average_recent_us(&self) -> u64 {
        if self.recent_durations_us.is_empty() {
            return 0;
        }
        self.recent_durations_us.iter().sum::<u64>() / self.recent_durations_us.len() as u64
    }
}

/// Innermost policy stage: times the call and records its outcome.
#[derive(Debug, Default)]
pub struct MetricsMiddleware {
    metrics: DashMap<String, EventTypeMetrics>,
}

impl MetricsMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the metrics for every event type seen so far.
    pub fn snapshot(&self) -> HashMap<String, EventTypeMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn for_type(&self, event_type: &str) -> Option<EventTypeMetrics> {
        self.metrics.get(event_type).map(|m| m.clone())
    }
}

#[async_trait]
impl Middleware for MetricsMiddleware {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()> {
        let started = Instant::now();
        let outcome = next.run(ctx, event).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(()) => debug!("✅ {} ({}) processed in {:?}", event.event_type, event.id, elapsed),
            Err(e) => warn!("❌ {} ({}) failed after {:?}: {}", event.event_type, event.id, elapsed, e),
        }

        self.metrics
            .entry(event.event_type.clone())
            .or_default()
            .record(elapsed, outcome.is_ok());
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::test_support::CountingEndpoint;
    use crate::middleware::MiddlewareChain;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_history_is_bounded() {
        let mut metrics = EventTypeMetrics::default();
        for i in 0..(MAX_DURATION_SAMPLES as u64 + 20) {
            metrics.record(Duration::from_micros(i), true);
        }
        assert_eq!(metrics.recent_durations_us.len(), MAX_DURATION_SAMPLES);
        assert_eq!(metrics.recent_durations_us.front(), Some(&20));
        assert_eq!(metrics.success_count, MAX_DURATION_SAMPLES as u64 + 20);
    }

    #[tokio::test]
    async fn test_records_both_outcomes() {
        let metrics = Arc::new(MetricsMiddleware::new());
        let chain = MiddlewareChain::new().with_shared(metrics.clone());
        let endpoint = CountingEndpoint::default();
        let ctx = CancellationToken::new();
        let event = EventEnvelope::new("instance.created", "instance", "i-1", json!({}));

        chain.execute(&ctx, &event, &endpoint).await.unwrap();
        endpoint.set_failing(true);
        assert!(chain.execute(&ctx, &event, &endpoint).await.is_err());

        let recorded = metrics.for_type("instance.created").unwrap();
        assert_eq!(recorded.success_count, 1);
        assert_eq!(recorded.failure_count, 1);
        assert_eq!(recorded.recent_durations_us.len(), 2);
        assert_eq!(metrics.snapshot().len(), 1);
    }
}
