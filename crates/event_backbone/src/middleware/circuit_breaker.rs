use super::{Middleware, Next};
use crate::envelope::EventEnvelope;
use crate::error::{EventError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls flow normally, failures are counted
    Closed,
    /// Calls are rejected until the timeout has elapsed
    Open,
    /// One trial call is let through to check recovery
    HalfOpen,
}

/// Three-state failure isolation for a single dependency.
///
/// Decisions are synchronous: [`allow_at`](Self::allow_at) before the call,
/// then [`record_success`](Self::record_success) or
/// [`record_failure_at`](Self::record_failure_at) after it.
///
/// A success while Closed also resets the failure count, so only consecutive
/// failures open the circuit.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    timeout: Duration,
    last_failure_time: Option<Instant>,
    /// Set while a HalfOpen trial call is outstanding
    trial_started_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            timeout,
            last_failure_time: None,
            trial_started_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Whether a call may proceed at `now`. May move Open → HalfOpen.
    pub fn allow_at(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled_down = self
                    .last_failure_time
                    .map(|failed_at| now.saturating_duration_since(failed_at) > self.timeout)
                    .unwrap_or(true);
                if cooled_down {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started_at = Some(now);
                }
                cooled_down
            }
            CircuitState::HalfOpen => {
                // A trial that never reported back (e.g. cancelled) frees its slot after `timeout`
                let trial_pending = self
                    .trial_started_at
                    .map(|started| now.saturating_duration_since(started) <= self.timeout)
                    .unwrap_or(false);
                if trial_pending {
                    false
                } else {
                    self.trial_started_at = Some(now);
                    true
                }
            }
        }
    }

    /// A success closes the circuit and clears the failure count.
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.trial_started_at = None;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        self.last_failure_time = Some(now);
        self.trial_started_at = None;
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                self.failure_count += 1;
                self.state = CircuitState::Open;
            }
        }
    }
}

/// One [`CircuitBreaker`] per event type.
#[derive(Debug)]
pub struct CircuitBreakerMiddleware {
    failure_threshold: u32,
    timeout: Duration,
    breakers: DashMap<String, CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_threshold,
            timeout,
            breakers: DashMap::new(),
        }
    }

    /// Current state for `event_type`; unseen types are closed.
    pub fn state(&self, event_type: &str) -> CircuitState {
        self.breakers
            .get(event_type)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failure_count(&self, event_type: &str) -> u32 {
        self.breakers.get(event_type).map(|b| b.failure_count()).unwrap_or(0)
    }

    /// Operator override: forget everything about `event_type`.
    pub fn reset(&self, event_type: &str) {
        if self.breakers.remove(event_type).is_some() {
            info!("🔌 Circuit for {} reset", event_type);
        }
    }

    fn allow(&self, event_type: &str) -> bool {
        self.breakers
            .entry(event_type.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.timeout))
            .allow_at(Instant::now())
    }

    fn record(&self, event_type: &str, success: bool) {
        if let Some(mut breaker) = self.breakers.get_mut(event_type) {
            let before = breaker.state();
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure_at(Instant::now());
            }
            let after = breaker.state();
            if before != after {
                match after {
                    CircuitState::Open => warn!("🔌 Circuit for {} opened after {} failures", event_type, breaker.failure_count()),
                    CircuitState::Closed => info!("🔌 Circuit for {} closed", event_type),
                    CircuitState::HalfOpen => {}
                }
            }
        }
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn name(&self) -> &str {
        "circuit_breaker"
    }

    async fn process(&self, ctx: &CancellationToken, event: &EventEnvelope, next: Next<'_>) -> Result<()> {
        if !self.allow(&event.event_type) {
            return Err(EventError::CircuitOpen(event.event_type.clone()));
        }
        let outcome = next.run(ctx, event).await;
        self.record(&event.event_type, outcome.is_ok());
        outcome
    }
}
