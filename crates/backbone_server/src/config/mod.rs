//! Configuration module for the event backbone node
//!
//! This module handles command-line arguments, configuration file parsing,
//! and provides default settings for the node.

pub mod args;
pub mod settings;

pub use args::Args;
pub use settings::{Config, LoggingSettings, NodeSettings};

use anyhow::{Context, Result};
use tracing::{info, warn};

/// Load configuration from file or create default configuration
///
/// If the file doesn't exist, a default configuration file is written and
/// the defaults are returned. Command-line overrides are applied afterwards
/// and the engine settings are validated.
///
/// # Errors
/// * File I/O failures
/// * TOML parsing failures
/// * Engine settings that fail validation
pub async fn load_config(args: &Args) -> Result<Config> {
    let mut config = if args.config.exists() {
        let config_str = tokio::fs::read_to_string(&args.config).await?;
        match toml::de::from_str::<Config>(&config_str) {
            Ok(config) => config,
            Err(e) => {
                warn!("Failed to parse config file {}: {}", args.config.display(), e);
                return Err(e.into());
            }
        }
    } else {
        warn!("Configuration file not found: {}, using defaults", args.config.display());

        let default_config = Config::default();
        let config_str = toml::to_string_pretty(&default_config)?;
        tokio::fs::write(&args.config, config_str).await?;
        info!("📝 Created default configuration file: {}", args.config.display());

        default_config
    };

    apply_overrides(&mut config, args);
    config
        .engine()
        .validate()
        .with_context(|| format!("invalid configuration in {}", args.config.display()))?;
    Ok(config)
}

/// Applies command-line flags on top of the file configuration.
pub fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(workers) = args.workers {
        config.dispatcher.worker_count = workers;
    }
    if let Some(name) = &args.name {
        config.node.name = name.clone();
    }
    if args.debug {
        config.logging.level = "debug".to_string();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_load_config_default() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_path_buf();
        let args = Args {
            config: path.clone(),
            ..Default::default()
        };

        // Delete the file to test default creation
        drop(temp_file);

        let config = load_config(&args).await.unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_load_config_existing() {
        let mut temp_file = NamedTempFile::new().unwrap();
        let config_content = r#"
[node]
name = "realm-us-1"

[dispatcher]
worker_count = 2
queue_size = 64

[broker]
subject_prefix = "realm"
dead_letter_subject = "realm.dead_letter"
"#;
        temp_file.write_all(config_content.as_bytes()).unwrap();

        let args = Args {
            config: temp_file.path().to_path_buf(),
            workers: Some(6),
            ..Default::default()
        };

        let config = load_config(&args).await.unwrap();
        assert_eq!(config.node.name, "realm-us-1");
        assert_eq!(config.dispatcher.worker_count, 6);
        assert_eq!(config.dispatcher.queue_size, 64);
        assert_eq!(config.broker.subject_prefix, "realm");
        assert_eq!(config.broker.dead_letter_subject.as_deref(), Some("realm.dead_letter"));
    }

    #[tokio::test]
    async fn test_load_config_rejects_invalid_engine_settings() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[dispatcher]\nqueue_size = 0\n").unwrap();

        let args = Args {
            config: temp_file.path().to_path_buf(),
            ..Default::default()
        };
        assert!(load_config(&args).await.is_err());
    }

    #[tokio::test]
    async fn test_load_config_malformed() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"[dispatcher\nworker_count = ").unwrap();

        let args = Args {
            config: temp_file.path().to_path_buf(),
            ..Default::default()
        };
        assert!(load_config(&args).await.is_err());
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        let args = Args {
            debug: true,
            json_logs: true,
            name: Some("edge".into()),
            ..Default::default()
        };
        apply_overrides(&mut config, &args);
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.node.name, "edge");
    }
}
