//! Cooperative cancellation
//!
//! The token is only polled at phase and batch boundaries; nothing in flight
//! is interrupted. A second shutdown signal ends the process immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Exit status used when a second signal forces the process down
const FORCED_EXIT_CODE: i32 = 130;

/// What to do with a received shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// First signal: stop at the next boundary and save
    Cancel,
    /// Repeated signal: exit without waiting
    Exit,
}

/// Shared, cloneable cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn signal_received(&self) -> SignalAction {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            SignalAction::Exit
        } else {
            SignalAction::Cancel
        }
    }

    /// Cancels this token on Ctrl-C, and on SIGTERM where it exists
    ///
    /// The first signal cancels the token; any later one exits the process.
    /// Must be called inside a tokio runtime. The SIGTERM handler is
    /// installed before this returns.
    pub fn cancel_on_shutdown_signal(&self) -> std::io::Result<()> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let token = self.clone();
        tokio::spawn(async move {
            loop {
                #[cfg(unix)]
                let received = tokio::select! {
                    result = tokio::signal::ctrl_c() => result.ok().map(|_| "interrupt"),
                    signal = terminate.recv() => signal.map(|_| "terminate"),
                };
                #[cfg(not(unix))]
                let received = tokio::signal::ctrl_c().await.ok().map(|_| "interrupt");

                let Some(name) = received else {
                    tracing::warn!("Shutdown signal listener stopped");
                    break;
                };

                match token.signal_received() {
                    SignalAction::Cancel => tracing::warn!(
                        signal = name,
                        "Shutting down: finishing current batch and saving checkpoint \
                         (signal again to exit immediately)"
                    ),
                    SignalAction::Exit => {
                        tracing::error!(signal = name, "Second signal received, exiting now");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                }
            }
        });

        Ok(())
    }
}
