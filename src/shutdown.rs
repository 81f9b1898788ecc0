//! Ctrl+C / SIGTERM handling for capstream.
//!
//! A [`ShutdownSignal`] turns the first termination signal into a cancelled
//! [`CancellationToken`]. The pipeline checks that token between pages, so an
//! interrupted run stops downloading, drains what it already has and still
//! writes a (partial) result.
//!
//! # Example
//!
//! ```rust,ignore
//! use capstream::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let _listener = shutdown.listen();
//!
//! let records = pipeline.run(roster, window, progress, shutdown.token()).await?;
//! if shutdown.is_shutdown() {
//!     // partial result
//! }
//! ```

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A signal for stopping a run early.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    token: CancellationToken,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for a termination signal (SIGTERM or SIGINT), then trigger.
    ///
    /// Returns early if shutdown was already triggered some other way.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = self.token.cancelled() => return,
            _ = ctrl_c => {
                warn!("Received Ctrl+C, finishing with the events downloaded so far...");
            }
            _ = terminate => {
                warn!("Received SIGTERM, finishing with the events downloaded so far...");
            }
        }

        self.token.cancel();
    }

    /// Spawn a task that runs [`wait`](Self::wait) in the background.
    pub fn listen(&self) -> JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move { signal.wait().await })
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.token.cancel();
    }
}
