//! Graceful shutdown handling
//!
//! Listens for termination signals and hands the node a receiver that
//! resolves when shutdown is requested.

use tokio::sync::oneshot;
use tracing::{info, warn};

/// Set up a shutdown signal handler
///
/// # Platform Support
/// * Unix/Linux: SIGINT (Ctrl+C) and SIGTERM
/// * Elsewhere: Ctrl+C
///
/// If the Unix signal handlers cannot be installed, falls back to Ctrl+C.
pub async fn setup_shutdown_handler() -> oneshot::Receiver<()> {
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(());
    });

    rx
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(mut sigint), Ok(mut sigterm)) => {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("🛑 SIGINT received - initiating graceful shutdown");
                }
                _ = sigterm.recv() => {
                    info!("🛑 SIGTERM received - initiating graceful shutdown");
                }
            }
        }
        (Err(e), _) | (_, Err(e)) => {
            warn!("⚠️ Failed to install signal handlers ({}), falling back to Ctrl+C", e);
            wait_for_ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("🛑 Ctrl+C received - initiating graceful shutdown"),
        Err(e) => {
            warn!("⚠️ Unable to listen for Ctrl+C: {}", e);
            // Without a signal source the node runs until killed.
            std::future::pending::<()>().await;
        }
    }
}
