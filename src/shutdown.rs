//! Termination signal handling.
//!
//! This module turns SIGINT and SIGTERM into a single process-wide
//! "termination requested" event. The coordinator observes it once; a signal
//! that arrives while shutdown is already in progress is ignored.

use std::fmt;

use tokio::signal;

/// The kind of termination request that started shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM (common in containerized environments)
    Terminate,
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationSignal::Interrupt => f.write_str("interrupt"),
            TerminationSignal::Terminate => f.write_str("terminated"),
        }
    }
}

/// Creates a future that completes when a termination signal is received.
///
/// This function listens for:
/// - SIGINT (Ctrl+C)
/// - SIGTERM (unix only)
///
/// and resolves with whichever arrives first.
///
/// # Example
///
/// ```ignore
/// use drainpipe::shutdown::shutdown_signal;
///
/// let outcome = coordinator.run(shutdown_signal()).await;
/// ```
pub async fn shutdown_signal() -> TerminationSignal {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => TerminationSignal::Interrupt,
        () = terminate => TerminationSignal::Terminate,
    }
}
