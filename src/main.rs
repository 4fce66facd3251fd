use std::process::ExitCode;
use std::sync::Arc;

use drainpipe::config::ServiceConfig;
use drainpipe::routes::{create_router, AppState};
use drainpipe::shutdown::shutdown_signal;
use drainpipe::{BackgroundTaskTracker, HttpServer, ShutdownCoordinator};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "drainpipe=info".into()),
        )
        .init();

    // Load configuration from CLI args, environment variables, and config file
    let config = match ServiceConfig::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    // Background work dispatched by handlers is drained before exit
    let tasks = BackgroundTaskTracker::new();

    let span = tracing::info_span!("drainpipe", env = %config.env);
    let app = create_router(AppState::new(config.clone(), tasks.clone()));
    let server = Arc::new(HttpServer::new(config, app));

    match ShutdownCoordinator::new(server, tasks)
        .run(shutdown_signal())
        .instrument(span)
        .await
    {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Server exited with error");
            ExitCode::FAILURE
        }
    }
}
