//! Serving connections until told to stop.
//!
//! [`ServerHandle`] is the seam between the shutdown coordinator and whatever
//! actually accepts connections. [`HttpServer`] is the HTTP/1 implementation:
//! it runs its own accept loop so that shutdown can stop accepting, ask every
//! open connection to finish its current exchange, and abort the stragglers
//! once the grace period is spent.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
    Router,
};
use hyper::{body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Notify, OnceCell};
use tokio::time::Instant;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tower::ServiceExt;

use crate::config::ServiceConfig;
use crate::error::{ServerError, ShutdownError};

/// First delay after a transient accept error
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
/// Upper bound for the accept retry delay
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Something that accepts connections and dispatches them until stopped.
#[async_trait]
pub trait ServerHandle: Send + Sync + 'static {
    /// Accept and serve connections until shutdown is requested or the
    /// listener fails.
    ///
    /// Returns [`ServerError::Closed`] when it stopped because of
    /// [`shutdown`](Self::shutdown); any other error is a genuine fault.
    async fn run(&self) -> Result<(), ServerError>;

    /// Stop accepting and wait up to `deadline` for open connections to finish.
    ///
    /// Idempotent: every call after the first waits for, and returns, the
    /// outcome of the first.
    async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError>;

    /// Address the server listens on, for log lines.
    fn addr(&self) -> String;
}

/// HTTP/1 server dispatching every request to an axum [`Router`].
pub struct HttpServer {
    config: ServiceConfig,
    router: Router,
    /// Cancelled once shutdown starts: stop accepting, close connections gracefully.
    stop: CancellationToken,
    /// Cancelled when the grace period runs out: drop connections immediately.
    abort: CancellationToken,
    /// Holds a token while the accept loop runs.
    acceptor: TaskTracker,
    connections: TaskTracker,
    bound: watch::Sender<Option<SocketAddr>>,
    outcome: OnceCell<Result<(), ShutdownError>>,
}

impl HttpServer {
    /// Create a server for `config` that dispatches requests to `router`.
    ///
    /// Nothing is bound until [`run`](ServerHandle::run) is called.
    pub fn new(config: ServiceConfig, router: Router) -> Self {
        let (bound, _) = watch::channel(None);

        Self {
            config,
            router,
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            acceptor: TaskTracker::new(),
            connections: TaskTracker::new(),
            bound,
            outcome: OnceCell::new(),
        }
    }

    /// The bound address, once `run` has bound the listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until the listener is bound and return its address.
    ///
    /// Returns `None` if shutdown starts first.
    pub async fn listening(&self) -> Option<SocketAddr> {
        let mut rx = self.bound.subscribe();

        tokio::select! {
            bound = rx.wait_for(Option::is_some) => bound.ok().and_then(|addr| *addr),
            () = self.stop.cancelled() => None,
        }
    }

    /// Number of connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let router = self.router.clone();
        let stop = self.stop.clone();
        let abort = self.abort.clone();
        let idle_timeout = self.config.idle_timeout;
        let read_timeout = self.config.read_timeout;
        let write_timeout = self.config.write_timeout;

        self.connections.spawn(async move {
            let activity = Activity::new();

            let service = {
                let activity = activity.clone();
                service_fn(move |request: Request<Incoming>| {
                    let router = router.clone();
                    let busy = activity.begin();

                    async move {
                        let _busy = busy;
                        let dispatch = router.oneshot(request.map(Body::new));

                        let response = match tokio::time::timeout(write_timeout, dispatch).await {
                            Ok(Ok(response)) => response,
                            Ok(Err(never)) => match never {},
                            Err(_) => {
                                tracing::warn!(%peer, timeout = ?write_timeout, "Handler timed out");
                                handler_timeout_response()
                            }
                        };

                        Ok::<_, Infallible>(response)
                    }
                })
            };

            // Read and idle deadlines are enforced by the watchdog below, so
            // hyper's own header timer stays off.
            let io = ActivityStream {
                inner: stream,
                activity: activity.clone(),
            };
            let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
            tokio::pin!(conn);

            let mut closing = false;
            let result = loop {
                tokio::select! {
                    biased;
                    () = abort.cancelled() => {
                        tracing::debug!(%peer, "Aborting connection");
                        return;
                    }
                    result = conn.as_mut() => break result,
                    () = stop.cancelled(), if !closing => {
                        closing = true;
                        conn.as_mut().graceful_shutdown();
                    }
                    expiry = activity.expired(idle_timeout, read_timeout), if !closing => match expiry {
                        Expiry::Idle => {
                            tracing::debug!(%peer, "Closing idle connection");
                            closing = true;
                            conn.as_mut().graceful_shutdown();
                        }
                        Expiry::HeadRead => {
                            tracing::debug!(%peer, timeout = ?read_timeout, "Request head timed out");
                            return;
                        }
                    },
                }
            };

            if let Err(e) = result {
                tracing::debug!(%peer, error = %e, "Connection ended with error");
            }
        });
    }

    async fn close_connections(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.stop.cancel();
        self.acceptor.close();
        self.connections.close();

        tracing::debug!(
            open = self.connections.len(),
            grace_period = ?deadline,
            "Closing connections"
        );

        let drained = async {
            // The accept loop registers every connection it accepted before it exits.
            self.acceptor.wait().await;
            self.connections.wait().await;
        };
        if tokio::time::timeout(deadline, drained).await.is_ok() {
            return Ok(());
        }

        let open = self.connections.len();
        tracing::warn!(open, "Grace period elapsed, aborting connections");
        self.abort.cancel();
        self.acceptor.wait().await;
        self.connections.wait().await;

        Err(ShutdownError::DeadlineExceeded { open, deadline })
    }
}

#[async_trait]
impl ServerHandle for HttpServer {
    async fn run(&self) -> Result<(), ServerError> {
        if self.stop.is_cancelled() {
            return Err(ServerError::Closed);
        }

        // Held until the loop exits, so a connection accepted just before
        // shutdown is tracked before `close_connections` can see zero.
        let _accepting = self.acceptor.token();

        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        self.bound.send_replace(Some(local_addr));
        tracing::debug!(addr = %local_addr, "Listener bound");

        let mut backoff = Duration::ZERO;
        loop {
            let accepted = tokio::select! {
                biased;
                () = self.stop.cancelled() => return Err(ServerError::Closed),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = Duration::ZERO;
                    tracing::trace!(%peer, "Connection accepted");
                    self.serve_connection(stream, peer);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    backoff = next_backoff(backoff);
                    tracing::warn!(error = %e, retry_in = ?backoff, "Accept failed, retrying");

                    tokio::select! {
                        biased;
                        () = self.stop.cancelled() => return Err(ServerError::Closed),
                        () = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => return Err(ServerError::Accept(e)),
            }
        }
    }

    async fn shutdown(&self, deadline: Duration) -> Result<(), ShutdownError> {
        self.outcome
            .get_or_init(|| self.close_connections(deadline))
            .await
            .clone()
    }

    fn addr(&self) -> String {
        match self.local_addr() {
            Some(addr) => addr.to_string(),
            None => self.config.bind_addr(),
        }
    }
}

/// Accept errors that concern a single connection or a momentary resource
/// shortage, not the listener itself.
fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) {
        return true;
    }

    // ENFILE / EMFILE: out of file descriptors, may clear once connections close
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }

    false
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_MIN
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

fn handler_timeout_response() -> Response {
    let mut response = Response::new(Body::from(r#"{"error":"request timed out"}"#));
    *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Marker for "no request head is being read"
const NO_HEAD: u64 = u64::MAX;

/// Why a connection's watchdog fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expiry {
    /// No request in flight and no bytes received for the idle timeout.
    Idle,
    /// A request head started arriving but did not complete in time.
    HeadRead,
}

/// Per-connection record of request activity.
///
/// Three states: a request is in flight, a request head is arriving
/// (bytes received since the last request finished), or the connection is
/// idle. A fresh connection starts out waiting for its first head.
#[derive(Debug, Clone)]
struct Activity {
    inner: Arc<ActivityState>,
}

#[derive(Debug)]
struct ActivityState {
    opened: Instant,
    in_flight: AtomicUsize,
    /// Milliseconds after `opened` at which the last request started or finished
    last_active_ms: AtomicU64,
    /// Milliseconds after `opened` at which the pending request head began, or `NO_HEAD`
    head_started_ms: AtomicU64,
    changed: Notify,
}

impl Activity {
    fn new() -> Self {
        Self {
            inner: Arc::new(ActivityState {
                opened: Instant::now(),
                in_flight: AtomicUsize::new(0),
                last_active_ms: AtomicU64::new(0),
                head_started_ms: AtomicU64::new(0),
                changed: Notify::new(),
            }),
        }
    }

    fn begin(&self) -> Busy {
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner.head_started_ms.store(NO_HEAD, Ordering::SeqCst);
        self.touch();
        self.inner.changed.notify_waiters();
        Busy {
            activity: self.clone(),
        }
    }

    /// Record bytes read from the socket.
    ///
    /// Outside of a request these are the start of the next request head.
    fn received(&self) {
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            return;
        }
        let started = self
            .inner
            .head_started_ms
            .compare_exchange(NO_HEAD, self.elapsed_ms(), Ordering::SeqCst, Ordering::SeqCst);
        if started.is_ok() {
            self.inner.changed.notify_waiters();
        }
    }

    fn elapsed_ms(&self) -> u64 {
        // u64::MAX is reserved for NO_HEAD
        u64::try_from(self.inner.opened.elapsed().as_millis()).unwrap_or(u64::MAX - 1)
    }

    fn touch(&self) {
        self.inner
            .last_active_ms
            .fetch_max(self.elapsed_ms(), Ordering::SeqCst);
    }

    fn at(&self, ms: u64) -> Instant {
        self.inner.opened + Duration::from_millis(ms)
    }

    /// Resolves once the connection sat idle for `idle` or spent longer than
    /// `read` receiving a request head.
    async fn expired(&self, idle: Duration, read: Duration) -> Expiry {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let now = Instant::now();
            let deadline = if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
                None
            } else {
                let head = self.inner.head_started_ms.load(Ordering::SeqCst);
                let (expiry, deadline) = if head == NO_HEAD {
                    let last = self.inner.last_active_ms.load(Ordering::SeqCst);
                    (Expiry::Idle, self.at(last) + idle)
                } else {
                    (Expiry::HeadRead, self.at(head) + read)
                };
                if deadline <= now {
                    return expiry;
                }
                Some(deadline)
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => {}
                        () = changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }
}

/// Marks a request as in flight until dropped.
struct Busy {
    activity: Activity,
}

impl Drop for Busy {
    fn drop(&mut self) {
        self.activity.touch();
        self.activity.inner.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.activity.inner.changed.notify_waiters();
    }
}

/// Socket wrapper that reports received bytes to the connection's [`Activity`].
struct ActivityStream {
    inner: TcpStream,
    activity: Activity,
}

impl AsyncRead for ActivityStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.received();
        }
        poll
    }
}

impl AsyncWrite for ActivityStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
