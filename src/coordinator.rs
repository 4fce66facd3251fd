//! Orderly, time-bounded shutdown of a running server.
//!
//! The coordinator runs the server's serve loop on the calling task and, next
//! to it, a watcher task that waits for a termination signal:
//!
//! ```text
//! Running ── signal ──▶ SignalReceived ── shutdown(grace) ──▶ Draining ──▶ Stopped
//!    │                                          │                  (tasks drained)
//!    │ listen fault                             │ shutdown fault
//!    ▼                                          ▼
//!  Failed                                     Failed
//! ```
//!
//! The watcher hands its result back over a one-shot channel. The serve loop
//! returning [`ServerError::Closed`] only means shutdown has begun; the value
//! on that channel is what decides how the run ended.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::Instrument;

use crate::error::{LifecycleError, ShutdownError};
use crate::server::ServerHandle;
use crate::shutdown::TerminationSignal;
use crate::tracker::BackgroundTaskTracker;

/// Time open connections get to finish once shutdown starts.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Where a run currently is in the shutdown protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Serving; no termination signal yet.
    Running,
    /// A termination signal arrived and the server is shutting down.
    SignalReceived,
    /// The server has shut down; waiting for background tasks.
    Draining,
    /// Everything finished cleanly.
    Stopped,
    /// The listener or the shutdown failed.
    Failed,
}

/// Runs a server and reconciles how it ended into a single result.
pub struct ShutdownCoordinator<S> {
    server: Arc<S>,
    tasks: BackgroundTaskTracker,
    grace_period: Duration,
    phase: Arc<watch::Sender<Phase>>,
}

impl<S: ServerHandle> ShutdownCoordinator<S> {
    /// Create a coordinator for `server` that drains `tasks` on shutdown.
    pub fn new(server: Arc<S>, tasks: BackgroundTaskTracker) -> Self {
        let (phase, _) = watch::channel(Phase::Running);

        Self {
            server,
            tasks,
            grace_period: SHUTDOWN_GRACE_PERIOD,
            phase: Arc::new(phase),
        }
    }

    /// Override the shutdown grace period (for testing)
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// The grace period handed to [`ServerHandle::shutdown`].
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Current phase of the run.
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribe to phase transitions.
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Serve until `signal` resolves, then shut down and drain.
    ///
    /// A listen fault ends the run immediately without waiting for `signal`
    /// and without calling shutdown. Otherwise the result is that of the
    /// shutdown: `Ok(())` once the server stopped within the grace period and
    /// every background task completed, or the shutdown fault.
    ///
    /// A background task that never completes keeps this future pending.
    pub async fn run<F>(&self, signal: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = TerminationSignal> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let watcher = tokio::spawn(await_termination(
            self.server.clone(),
            self.tasks.clone(),
            self.phase.clone(),
            self.grace_period,
            signal,
            done_tx,
        )
        .in_current_span());

        let addr = self.server.addr();
        tracing::info!(%addr, "Starting server");

        // `Ok(())` is treated like `Closed`: only the watcher knows how it ended.
        if let Err(e) = self.server.run().await {
            if !e.is_closed() {
                watcher.abort();
                self.phase.send_replace(Phase::Failed);
                tracing::error!(%addr, error = %e, "Server failed");
                return Err(LifecycleError::Listen(e));
            }
        }

        let outcome = match done_rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(LifecycleError::Shutdown(e)),
            Err(_) => Err(LifecycleError::Interrupted),
        };

        match &outcome {
            Ok(()) => {
                self.phase.send_replace(Phase::Stopped);
                tracing::info!(%addr, "Stopped server");
            }
            Err(e) => {
                self.phase.send_replace(Phase::Failed);
                tracing::error!(%addr, error = %e, "Shutdown failed");
            }
        }

        outcome
    }
}

/// Wait for a termination signal, shut the server down and drain tasks.
///
/// Sends exactly one value on `done`: the shutdown fault as soon as it is
/// known, or `Ok(())` once draining finishes.
async fn await_termination<S, F>(
    server: Arc<S>,
    tasks: BackgroundTaskTracker,
    phase: Arc<watch::Sender<Phase>>,
    grace_period: Duration,
    signal: F,
    done: oneshot::Sender<Result<(), ShutdownError>>,
) where
    S: ServerHandle,
    F: Future<Output = TerminationSignal>,
{
    let signal = signal.await;
    phase.send_replace(Phase::SignalReceived);
    tracing::info!(%signal, "Caught signal");

    let shutdown = server.shutdown(grace_period).await;

    phase.send_replace(Phase::Draining);
    tracing::info!(
        addr = %server.addr(),
        outstanding = tasks.outstanding(),
        "Completing background tasks"
    );

    let mut done = Some(done);
    if let Err(e) = shutdown {
        if let Some(done) = done.take() {
            let _ = done.send(Err(e));
        }
    }

    tasks.wait_drained().await;

    if let Some(done) = done {
        let _ = done.send(Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServerError;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::timeout;
    use tokio_util::sync::CancellationToken;

    /// Server double whose run and shutdown results are scripted.
    struct MockServer {
        listen_fault: bool,
        shutdown_result: Result<(), ShutdownError>,
        panic_on_shutdown: bool,
        shutdown_calls: AtomicUsize,
        deadlines: Mutex<Vec<Duration>>,
        stop: CancellationToken,
    }

    impl MockServer {
        fn new() -> Self {
            Self {
                listen_fault: false,
                shutdown_result: Ok(()),
                panic_on_shutdown: false,
                shutdown_calls: AtomicUsize::new(0),
                deadlines: Mutex::new(Vec::new()),
                stop: CancellationToken::new(),
            }
        }

        fn failing_listener() -> Self {
            Self {
                listen_fault: true,
                ..Self::new()
            }
        }

        fn failing_shutdown(err: ShutdownError) -> Self {
            Self {
                shutdown_result: Err(err),
                ..Self::new()
            }
        }

        fn panicking_shutdown() -> Self {
            Self {
                panic_on_shutdown: true,
                ..Self::new()
            }
        }

        fn shutdown_calls(&self) -> usize {
            self.shutdown_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServerHandle for MockServer {
        async fn run(&self) -> Result<(), ServerError> {
            if self.listen_fault {
                return Err(ServerError::Accept(io::Error::new(
                    io::ErrorKind::Other,
                    "listener gone",
                )));
            }
            self.stop.cancelled().await;
            Err(ServerError::Closed)
        }

        async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
            self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
            self.deadlines.lock().unwrap().push(deadline);
            self.stop.cancel();
            if self.panic_on_shutdown {
                panic!("shutdown blew up");
            }
            self.shutdown_result.clone()
        }

        fn addr(&self) -> String {
            "mock".to_string()
        }
    }

    /// A termination signal fired by sending on the returned channel.
    fn manual_signal() -> (
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

    #[test]
    fn test_default_grace_period() {
        let coordinator =
            ShutdownCoordinator::new(Arc::new(MockServer::new()), BackgroundTaskTracker::new());
        assert_eq!(coordinator.grace_period(), Duration::from_secs(30));
        assert_eq!(coordinator.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn test_listen_fault_skips_shutdown() {
        let server = Arc::new(MockServer::failing_listener());
        let coordinator = ShutdownCoordinator::new(server.clone(), BackgroundTaskTracker::new());
        let (_trigger, signal) = manual_signal();

        let result = timeout(Duration::from_secs(1), coordinator.run(signal))
            .await
            .expect("listen fault must not wait for a signal");

        assert!(matches!(
            result,
            Err(LifecycleError::Listen(ServerError::Accept(_)))
        ));
        assert_eq!(server.shutdown_calls(), 0);
        assert_eq!(coordinator.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_signal_leads_to_clean_stop() {
        let server = Arc::new(MockServer::new());
        let coordinator = ShutdownCoordinator::new(server.clone(), BackgroundTaskTracker::new())
            .with_grace_period(Duration::from_millis(50));
        let (trigger, signal) = manual_signal();

        trigger.send(TerminationSignal::Terminate).unwrap();
        let result = timeout(Duration::from_secs(1), coordinator.run(signal))
            .await
            .unwrap();

        assert!(result.is_ok());
        assert_eq!(server.shutdown_calls(), 1);
        assert_eq!(
            *server.deadlines.lock().unwrap(),
            vec![Duration::from_millis(50)]
        );
        assert_eq!(coordinator.phase(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_shutdown_fault_is_the_outcome() {
        let deadline = Duration::from_millis(50);
        let server = Arc::new(MockServer::failing_shutdown(
            ShutdownError::DeadlineExceeded { open: 1, deadline },
        ));
        let coordinator = ShutdownCoordinator::new(server.clone(), BackgroundTaskTracker::new());
        let (trigger, signal) = manual_signal();

        trigger.send(TerminationSignal::Interrupt).unwrap();
        let result = timeout(Duration::from_secs(1), coordinator.run(signal))
            .await
            .unwrap();

        match result {
            Err(LifecycleError::Shutdown(err)) => {
                assert_eq!(err, ShutdownError::DeadlineExceeded { open: 1, deadline })
            }
            other => panic!("expected shutdown fault, got {other:?}"),
        }
        assert_eq!(coordinator.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_fault_does_not_wait_for_drain() {
        let tasks = BackgroundTaskTracker::new();
        tasks.register();

        let server = Arc::new(MockServer::failing_shutdown(
            ShutdownError::DeadlineExceeded {
                open: 1,
                deadline: Duration::from_millis(50),
            },
        ));
        let coordinator = ShutdownCoordinator::new(server, tasks.clone());
        let (trigger, signal) = manual_signal();

        trigger.send(TerminationSignal::Terminate).unwrap();
        let result = timeout(Duration::from_secs(1), coordinator.run(signal))
            .await
            .expect("shutdown fault is reported without draining");

        assert!(matches!(result, Err(LifecycleError::Shutdown(_))));
        assert_eq!(tasks.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_outcome_waits_for_background_tasks() {
        let tasks = BackgroundTaskTracker::new();
        tasks.register();

        let coordinator = ShutdownCoordinator::new(Arc::new(MockServer::new()), tasks.clone());
        let mut phases = coordinator.subscribe();
        let (trigger, signal) = manual_signal();

        let run = tokio::spawn(async move { coordinator.run(signal).await });

        trigger.send(TerminationSignal::Terminate).unwrap();
        timeout(
            Duration::from_secs(1),
            phases.wait_for(|phase| *phase == Phase::Draining),
        )
        .await
        .unwrap()
        .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished(), "run must wait for the outstanding task");

        tasks.complete();
        let result = timeout(Duration::from_secs(1), run).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(*phases.borrow(), Phase::Stopped);
    }

    #[tokio::test]
    async fn test_uncompleted_task_hangs_in_draining() {
        let tasks = BackgroundTaskTracker::new();
        tasks.register();

        let grace_period = Duration::from_millis(50);
        let coordinator = ShutdownCoordinator::new(Arc::new(MockServer::new()), tasks)
            .with_grace_period(grace_period);
        let (trigger, signal) = manual_signal();

        trigger.send(TerminationSignal::Interrupt).unwrap();
        let result = timeout(
            grace_period + Duration::from_millis(200),
            coordinator.run(signal),
        )
        .await;

        assert!(result.is_err(), "drain has no deadline of its own");
        assert_eq!(coordinator.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_no_signal_keeps_running() {
        let server = Arc::new(MockServer::new());
        let coordinator = ShutdownCoordinator::new(server.clone(), BackgroundTaskTracker::new());
        let (_trigger, signal) = manual_signal();

        let result = timeout(Duration::from_millis(50), coordinator.run(signal)).await;

        assert!(result.is_err());
        assert_eq!(server.shutdown_calls(), 0);
        assert_eq!(coordinator.phase(), Phase::Running);
    }

    #[tokio::test]
    async fn test_watcher_panic_reports_interrupted() {
        let server = Arc::new(MockServer::panicking_shutdown());
        let coordinator = ShutdownCoordinator::new(server.clone(), BackgroundTaskTracker::new());
        let (trigger, signal) = manual_signal();

        trigger.send(TerminationSignal::Terminate).unwrap();
        let result = timeout(Duration::from_secs(1), coordinator.run(signal))
            .await
            .expect("a lost watcher must not hang the run");

        assert!(matches!(result, Err(LifecycleError::Interrupted)));
        assert_eq!(server.shutdown_calls(), 1);
        assert_eq!(coordinator.phase(), Phase::Failed);
    }

    #[tokio::test]
    async fn test_second_signal_during_shutdown_is_ignored() {
        let tasks = BackgroundTaskTracker::new();
        tasks.register();

        let server = Arc::new(MockServer::new());
        let coordinator = ShutdownCoordinator::new(server.clone(), tasks.clone());
        let mut phases = coordinator.subscribe();

        // Both signals go to the same source; only the first is consumed.
        let (signals, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let signal = async move {
            match rx.recv().await {
                Some(signal) => signal,
                None => std::future::pending().await,
            }
        };

        let run = tokio::spawn(async move { coordinator.run(signal).await });

        signals.send(TerminationSignal::Interrupt).unwrap();
        timeout(
            Duration::from_secs(1),
            phases.wait_for(|phase| *phase == Phase::Draining),
        )
        .await
        .unwrap()
        .unwrap();

        signals.send(TerminationSignal::Terminate).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());
        assert_eq!(*phases.borrow(), Phase::Draining);

        tasks.complete();
        let result = timeout(Duration::from_secs(1), run).await.unwrap().unwrap();

        assert!(result.is_ok());
        assert_eq!(server.shutdown_calls(), 1);
        assert_eq!(*phases.borrow(), Phase::Stopped);
    }

    /// Log sink shared between the subscriber and the test.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_lifecycle_logs_carry_the_run_span() {
        let logs = Captured::default();
        let sink = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .finish();
        // Current-thread runtime, so the watcher task logs through this too.
        let _default = tracing::subscriber::set_default(subscriber);

        let coordinator =
            ShutdownCoordinator::new(Arc::new(MockServer::new()), BackgroundTaskTracker::new());
        let (trigger, signal) = manual_signal();
        trigger.send(TerminationSignal::Terminate).unwrap();

        let span = tracing::info_span!("drainpipe", env = "staging");
        timeout(
            Duration::from_secs(1),
            coordinator.run(signal).instrument(span),
        )
        .await
        .unwrap()
        .unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        let starting: Vec<&&str> = lines
            .iter()
            .filter(|line| line.contains("Starting server"))
            .collect();
        assert_eq!(starting.len(), 1, "{output}");
        assert!(starting[0].contains("env=staging"), "{output}");
        assert!(starting[0].contains("addr=mock"), "{output}");

        let caught = lines
            .iter()
            .find(|line| line.contains("Caught signal"))
            .expect("signal is logged");
        assert!(caught.contains("env=staging"), "{output}");
    }
}
