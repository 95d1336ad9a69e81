//! Event backbone node - main entry point
//!
//! Runs one dispatcher node with its broker bridge until SIGINT/SIGTERM,
//! then drains queued events and shuts down.

use anyhow::{Context, Result};
use backbone_server::{
    config::{self, Args, Config},
    logging, shutdown, BackboneNode,
};
use clap::Parser;
use std::time::Instant;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let startup_start = Instant::now();

    let args = Args::parse();
    let config = config::load_config(&args)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    logging::setup_logging(&config.logging)?;

    info!("🚀 Starting event backbone node {}", config.node.name);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {}", args.config.display());
    log_configuration(&config);

    let node = BackboneNode::new(config).context("Failed to build node")?;
    node.start().await.context("Failed to start node")?;

    let shutdown_receiver = shutdown::setup_shutdown_handler().await;
    info!("Startup complete in {:.2?}", startup_start.elapsed());

    tokio::select! {
        _ = shutdown_receiver => {
            info!("Shutdown signal received");
        }
        _ = node.token().cancelled() => {
            info!("Node cancelled");
        }
    }

    let shutdown_start = Instant::now();
    node.stop().await;
    let stats = node.stats().await;
    info!("📊 Final stats: {}", stats.summary());
    info!("Node shutdown completed in {:.2?}", shutdown_start.elapsed());

    Ok(())
}

fn log_configuration(config: &Config) {
    info!("Node configuration:");
    info!("  Workers: {}", config.dispatcher.worker_count);
    info!("  Queue size: {}", config.dispatcher.queue_size);
    info!(
        "  Batching: {} events / {}ms",
        config.dispatcher.batch_size, config.dispatcher.batch_timeout_ms
    );
    info!(
        "  Retries: {} (base delay {}ms)",
        config.dispatcher.max_retries, config.dispatcher.retry_delay_ms
    );
    if config.dispatcher.enable_dead_letter {
        info!("  Dead letters: {}", config.dispatcher.dead_letter_subject);
    }
    info!(
        "  Rate limit: {} burst, {}/s",
        config.middleware.rate_limit_capacity, config.middleware.rate_limit_refill_per_sec
    );
    info!("  Broker subject prefix: {}", config.broker.subject_prefix);
}
