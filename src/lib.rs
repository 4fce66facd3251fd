//! drainpipe - lifecycle coordinator for HTTP services with bounded graceful shutdown

pub mod config;
pub mod coordinator;
pub mod error;
pub mod routes;
pub mod server;
pub mod shutdown;
pub mod tracker;

// Re-export the lifecycle API
pub use coordinator::{Phase, ShutdownCoordinator, SHUTDOWN_GRACE_PERIOD};
pub use error::{LifecycleError, ServerError, ShutdownError};
pub use server::{HttpServer, ServerHandle};
pub use tracker::BackgroundTaskTracker;
