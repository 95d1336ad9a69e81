//! Statistics types shared by the bus, worker pool and dispatcher.
//!
//! Counters are read-mostly aggregates updated under a write lock on every
//! completion. Every getter in the crate hands out a cloned snapshot, never
//! the live map.

use crate::utils::current_timestamp_millis;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-event-type counters maintained by the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventTypeStats {
    /// Events accepted by `dispatch`, `dispatch_async` or `dispatch_batch`
    pub dispatched_count: u64,
    /// Processing attempts that succeeded
    pub processed_count: u64,
    /// Processing attempts that failed (each retry counts)
    pub failed_count: u64,
    /// Attempts re-enqueued by the retry policy
    pub retried_count: u64,
    /// Messages that exhausted their retries and went to the dead-letter output
    pub dead_lettered_count: u64,
    /// Messages dropped (full queue on retry, or terminal with dead-lettering disabled)
    pub dropped_count: u64,
    /// `dispatch_async` calls rejected with `QueueFull`
    pub rejected_count: u64,
    pub total_processing_time_us: u64,
    pub average_processing_time_us: u64,
    /// Unix milliseconds of the last update
    pub last_activity: u64,
}

impl EventTypeStats {
    /// Folds one processing attempt into the counters.
    pub fn record_attempt(&mut self, elapsed: Duration, success: bool) {
        if success {
            self.processed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.total_processing_time_us += elapsed.as_micros() as u64;
        let attempts = self.processed_count + self.failed_count;
        if attempts > 0 {
            self.average_processing_time_us = self.total_processing_time_us / attempts;
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = current_timestamp_millis();
    }
}

/// Per-handler counters maintained by the event bus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerStats {
    pub handled_count: u64,
    pub failed_count: u64,
    pub total_processing_time_us: u64,
    pub average_processing_time_us: u64,
    pub last_activity: u64,
}

impl HandlerStats {
    pub fn record(&mut self, elapsed: Duration, success: bool) {
        if success {
            self.handled_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.total_processing_time_us += elapsed.as_micros() as u64;
        let total = self.handled_count + self.failed_count;
        if total > 0 {
            self.average_processing_time_us = self.total_processing_time_us / total;
        }
        self.last_activity = current_timestamp_millis();
    }
}

/// Event bus counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    /// Calls to `publish`/`publish_async`
    pub events_published: u64,
    /// Successful handler invocations
    pub events_handled: u64,
    /// Failed handler invocations
    pub handler_failures: u64,
    /// Published events that had no registered handler
    pub unobserved_events: u64,
    /// Current number of `(type, handler)` registrations
    pub handlers_registered: usize,
    pub by_handler: HashMap<String, HandlerStats>,
}

/// Counters for a single worker of the pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub worker_id: usize,
    pub processed: u64,
    pub failed: u64,
    pub total_time_us: u64,
    pub active: bool,
    pub last_activity: u64,
}

/// Pool-level view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub workers: Vec<WorkerStats>,
}

impl PoolStats {
    pub fn total_processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }
}

/// Snapshot returned by `EventDispatcher::get_stats`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub by_event_type: HashMap<String, EventTypeStats>,
    pub pool: PoolStats,
    /// Messages waiting in the dispatcher's own queue
    pub queue_depth: usize,
    /// Entries currently held in the in-memory dead-letter log
    pub dead_letters: usize,
    pub uptime_seconds: u64,
}

impl DispatcherStats {
    pub fn total_dispatched(&self) -> u64 {
        self.by_event_type.values().map(|s| s.dispatched_count).sum()
    }

    pub fn total_failed(&self) -> u64 {
        self.by_event_type.values().map(|s| s.failed_count).sum()
    }

    /// One-line summary used by the periodic metrics loop.
    pub fn summary(&self) -> String {
        let processed: u64 = self.by_event_type.values().map(|s| s.processed_count).sum();
        let dead: u64 = self.by_event_type.values().map(|s| s.dead_lettered_count).sum();
        format!(
            "dispatched={} processed={} failed={} dead_lettered={} queue={} pool_queue={} active_workers={}/{}",
            self.total_dispatched(),
            processed,
            self.total_failed(),
            dead,
            self.queue_depth,
            self.pool.queue_depth,
            self.pool.active_workers,
            self.pool.worker_count,
        )
    }
}
