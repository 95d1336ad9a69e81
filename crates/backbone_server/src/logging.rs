//! Logging system setup
//!
//! Initializes the tracing subscriber used by the node and every engine
//! component it hosts.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingSettings;

/// Initialize the logging system
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// global subscriber is already installed.
///
/// # Environment Variables
/// * `RUST_LOG` - Override the default logging filter (e.g., "debug", "event_backbone=trace")
pub fn setup_logging(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if settings.json_format {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    result.map_err(|e| anyhow!("Failed to initialize logging: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_setup_only_once() {
        let settings = LoggingSettings::default();
        let first = setup_logging(&settings);
        let second = setup_logging(&LoggingSettings {
            json_format: true,
            ..settings
        });

        // Another test in this binary may have installed a subscriber first.
        assert!(second.is_err());
        let _ = first;
    }
}
