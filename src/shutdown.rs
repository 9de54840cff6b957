//! Graceful shutdown handling.
//!
//! `flowcast serve` runs until SIGTERM/SIGINT. The coordinator turns the
//! signal into a watch-channel flip: the serve loop parks on
//! [`ShutdownCoordinator::wait_for_shutdown`], then stops the schedule
//! runner and lets in-flight sends finish before the process exits.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// Coordinates graceful shutdown across the serve loop.
///
/// Clones share one watch channel. Components either sample
/// [`is_shutdown_requested`](Self::is_shutdown_requested) or park on
/// [`wait_for_shutdown`](Self::wait_for_shutdown). Shutdown can also be
/// requested programmatically, which tests use in place of signals.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Create a coordinator with the process signal listener already
    /// running. This is the serve-loop entry point.
    pub fn install() -> Self {
        let coordinator = Self::new();
        coordinator.spawn_signal_listener();
        coordinator
    }

    /// Request shutdown. Idempotent; only the first call wakes waiters.
    pub fn request_shutdown(&self) {
        let flipped = self.tx.send_if_modified(|requested| {
            if *requested {
                false
            } else {
                *requested = true;
                true
            }
        });
        if flipped {
            info!("shutdown requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when shutdown is requested; immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside self, so wait_for cannot see it closed.
        let _ = rx.wait_for(|requested| *requested).await;
    }

    fn spawn_signal_listener(&self) {
        let coordinator = self.clone();

        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => {
                    info!(signal = name, "initiating graceful shutdown");
                }
                Err(e) => {
                    warn!(error = %e, "failed to install signal handlers, falling back to Ctrl+C");
                    if signal::ctrl_c().await.is_err() {
                        return;
                    }
                    info!("received Ctrl+C, initiating graceful shutdown");
                }
            }
            coordinator.request_shutdown();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => Ok("SIGTERM"),
        _ = sigint.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    signal::ctrl_c().await?;
    Ok("Ctrl+C")
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
