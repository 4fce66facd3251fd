//! Shared test utilities and helpers for drainpipe tests.
//!
//! This module provides common functionality used across integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use drainpipe::config::ServiceConfig;
use drainpipe::shutdown::TerminationSignal;
use drainpipe::{BackgroundTaskTracker, HttpServer, LifecycleError, Phase, ShutdownCoordinator};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Configuration binding an ephemeral port on loopback.
pub fn test_config() -> ServiceConfig {
    ServiceConfig::new("127.0.0.1", 0)
}

/// A termination signal fired by sending on the returned channel.
pub fn manual_signal() -> (
    oneshot::Sender<TerminationSignal>,
    impl Future<Output = TerminationSignal> + Send + 'static,
) {
    let (tx, rx) = oneshot::channel();
    let signal = async move {
        match rx.await {
            Ok(signal) => signal,
            Err(_) => std::future::pending().await,
        }
    };
    (tx, signal)
}

/// A real server driven by a coordinator on a background task.
pub struct TestService {
    pub addr: SocketAddr,
    pub server: Arc<HttpServer>,
    pub phases: watch::Receiver<Phase>,
    trigger: Option<oneshot::Sender<TerminationSignal>>,
    run: JoinHandle<Result<(), LifecycleError>>,
}

impl TestService {
    /// Start serving `router` with the given grace period.
    pub async fn start(
        config: ServiceConfig,
        router: Router,
        tasks: BackgroundTaskTracker,
        grace_period: Duration,
    ) -> Self {
        let server = Arc::new(HttpServer::new(config, router));
        let coordinator =
            ShutdownCoordinator::new(server.clone(), tasks).with_grace_period(grace_period);
        let phases = coordinator.subscribe();
        let (trigger, signal) = manual_signal();

        let run = tokio::spawn(async move { coordinator.run(signal).await });

        let addr = tokio::time::timeout(Duration::from_secs(5), server.listening())
            .await
            .expect("server should bind in time")
            .expect("server should bind");

        Self {
            addr,
            server,
            phases,
            trigger: Some(trigger),
            run,
        }
    }

    /// Full URL for `path` on this service.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Deliver a termination signal.
    pub fn terminate(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(TerminationSignal::Terminate);
        }
    }

    /// Wait for the run to finish and return its outcome.
    pub async fn outcome(self, limit: Duration) -> Result<(), LifecycleError> {
        tokio::time::timeout(limit, self.run)
            .await
            .expect("run should finish in time")
            .expect("run task should not panic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_uses_ephemeral_port() {
        let config = test_config();
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }
}
