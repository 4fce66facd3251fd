//! Error types for the serving and shutdown lifecycle.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors returned by [`ServerHandle::run`](crate::server::ServerHandle::run).
///
/// `Closed` is not a fault: it is what `run` returns after shutdown was
/// requested. Everything else means the server could not keep serving.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server stopped because shutdown was requested.
    #[error("server closed")]
    Closed,

    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener failed with an error that retrying will not fix.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

impl ServerError {
    /// Whether this is the sentinel returned after an intentional shutdown.
    pub fn is_closed(&self) -> bool {
        matches!(self, ServerError::Closed)
    }
}

/// Errors returned by [`ServerHandle::shutdown`](crate::server::ServerHandle::shutdown).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShutdownError {
    /// The grace period ran out with connections still open; they were aborted.
    #[error("{open} connection(s) still open after {deadline:?} grace period")]
    DeadlineExceeded { open: usize, deadline: Duration },
}

/// Final outcome of a failed run, as reported by the coordinator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The serve loop failed before or without a shutdown request.
    #[error("listen error: {0}")]
    Listen(#[source] ServerError),

    /// Graceful shutdown did not complete cleanly.
    #[error("shutdown error: {0}")]
    Shutdown(#[source] ShutdownError),

    /// The signal watcher went away without reporting an outcome.
    #[error("termination watcher exited without reporting an outcome")]
    Interrupted,
}
