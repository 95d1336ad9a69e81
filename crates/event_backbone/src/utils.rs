//! # Utility Functions
//!
//! Timestamp helpers shared by the envelope, statistics and dead-letter records.
//! All wall-clock values in this crate are Unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch yields `0`, which the validation
/// middleware then treats as an unset timestamp.
pub fn current_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp in seconds.
pub fn current_timestamp() -> u64 {
    current_timestamp_millis() / 1000
}
