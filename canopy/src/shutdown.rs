//! Signal handling for the canopy daemon.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::info;

pub static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

#[inline]
pub fn is_shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Mark shutdown as requested and wake every subscriber.
pub fn request_shutdown(shutdown_tx: &broadcast::Sender<()>, reason: &'static str) {
    if SHUTDOWN_REQUESTED.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(target: "canopy::shutdown", reason, "Shutdown requested");
    let _ = shutdown_tx.send(());
}

#[cfg(unix)]
#[allow(clippy::expect_used)] // Signal handlers are startup-critical; abort is correct on failure
pub fn install_signal_handlers(
    shutdown_tx: broadcast::Sender<()>,
) -> impl std::future::Future<Output = ()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

    async move {
        let reason = tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        };
        request_shutdown(&shutdown_tx, reason);
    }
}

#[cfg(windows)]
pub async fn install_signal_handlers(shutdown_tx: broadcast::Sender<()>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(target: "canopy::shutdown", error = %e, "Failed to listen for Ctrl+C");
        return;
    }
    request_shutdown(&shutdown_tx, "Ctrl+C");
}
