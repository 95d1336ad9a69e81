use super::{Middleware, Next};
use crate::envelope::EventEnvelope;
use crate::error::{EventError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Token bucket: admits while whole tokens remain, refilling lazily at a fixed rate.
///
/// Invariant: `0 <= tokens <= capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Refills for the time elapsed up to `now`, then takes one token if available.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Whole tokens currently available (without refilling).
    pub fn available(&self) -> u32 {
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }
}

/// Per-actor token-bucket admission.
///
/// Events without an actor (system events) are never throttled.
#[derive(Debug)]
pub struct RateLimitMiddleware {
    capacity: u32,
    refill_rate: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimitMiddleware {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: DashMap::new(),
        }
    }

    /// Admission check for `key` at `now`; the bucket is created full on first use.
    pub fn check_at(&self, key: &str, now: Instant) -> Result<()> {
        let admitted = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new_at(self.capacity, self.refill_rate, now))
            .try_acquire_at(now);

        if admitted {
            Ok(())
        } else {
            debug!("🚦 Rate limited actor {}", key);
            Err(EventError::RateLimited(key.to_string()))
        }
    }

    pub fn check(&self, key: &str) -> Result<()> {
        self.check_at(key, Instant::now())
    }

    /// Whole tokens left for `key`; unknown keys report a full bucket.
    pub fn available_tokens(&self, key: &str) -> u32 {
        self.buckets
            .get(key)
            .map(|bucket| bucket.available())
            .unwrap_or(self.capacity)
    }

    /// Number of actors with a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()> {
        if let Some(actor) = event.actor() {
            self.check(actor)?;
        }
        next.run(ctx, event).await
    }
}
