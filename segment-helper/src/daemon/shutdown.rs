//! SIGINT/SIGTERM handling shared by the helper and the coordinator.
//!
//! The terminated flag is process-wide because signal delivery has no way to
//! reach a particular context value; everything else observes the
//! coordinator's cancellation token.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

static TERMINATED: AtomicBool = AtomicBool::new(false);

pub fn is_terminated() -> bool {
    TERMINATED.load(Ordering::SeqCst)
}

pub fn set_terminated() {
    TERMINATED.store(true, Ordering::SeqCst);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    cancel: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once a signal arrives or `trigger` is called.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels every subscriber without marking the process terminated.
    pub fn trigger(&self) {
        self.cancel.cancel();
    }

    /// Wait for SIGINT or SIGTERM, mark the process terminated and cancel
    /// subscribers. Also returns if the token is cancelled by other means.
    pub async fn wait_for_signal(&self) -> ShutdownSignal {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install SIGINT handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        let received = tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT, cleaning up");
                ShutdownSignal::Interrupt
            }
            _ = terminate => {
                info!("Received SIGTERM, cleaning up");
                ShutdownSignal::Terminate
            }
            _ = self.cancel.cancelled() => return ShutdownSignal::Terminate,
        };

        set_terminated();
        self.cancel.cancel();
        received
    }
}
