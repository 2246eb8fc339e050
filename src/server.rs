//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`. No new connections are made.
//! 2. Moving the [`ShutdownCoordinator`] to `Draining`. Requests that arrive on
//!    already-open keep-alive connections get a fast `503`; every connection
//!    is asked to close once its current exchange completes.
//! 3. Waiting for the coordinator to stop: either the last in-flight request
//!    finished, or the drain timeout forced it.
//! 4. Returning the [`StopReason`] from [`Server::serve`], which lets `main`
//!    exit.
//!
//! Keep the drain timeout below `terminationGracePeriodSeconds`.

use std::any::Any;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::FutureExt;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::failure::FailureRecord;
use crate::handler::ErasedHandler;
use crate::request::Request;
use crate::responder::{ErrorResponder, GENERIC_MESSAGE, ResponseSlot};
use crate::response::Response;
use crate::router::Router;
use crate::shutdown::{InFlight, Phase, ShutdownCoordinator, StopReason};

/// Drain budget used by [`Server::bind`] until one is configured.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

enum Listen {
    Addr(String),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    listen: Listen,
    coordinator: ShutdownCoordinator,
    responder: ErrorResponder,
}

/// Everything a connection task needs, shared behind one `Arc`.
struct Shared {
    router: Router,
    responder: ErrorResponder,
    coordinator: ShutdownCoordinator,
}

impl Server {
    /// Configures the server to bind to `addr` (`host:port`) when
    /// [`serve`](Server::serve) is called. Resolution errors surface there.
    ///
    /// ```rust,no_run
    /// use quiesce::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        Self::with_listen(Listen::Addr(addr.into()))
    }

    /// Serves on an already-bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self::with_listen(Listen::Listener(listener))
    }

    /// Address and drain timeout from [`Config`].
    pub fn from_config(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let addr = config.bind_addr()?;
        Ok(Self::bind(addr.to_string()).drain_timeout(config.drain_timeout.0))
    }

    fn with_listen(listen: Listen) -> Self {
        Self {
            listen,
            coordinator: ShutdownCoordinator::new(DEFAULT_DRAIN_TIMEOUT),
            responder: ErrorResponder::default(),
        }
    }

    /// Sets the drain budget on the current coordinator. Clones already handed
    /// out see the new value.
    pub fn drain_timeout(self, timeout: Duration) -> Self {
        self.coordinator.set_drain_timeout(timeout);
        self
    }

    /// Uses an existing coordinator, e.g. one shared with background workers
    /// whose tracked jobs should hold the drain open too.
    pub fn with_coordinator(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.coordinator = coordinator;
        self
    }

    /// Uses a custom responder, typically one with its own diagnostic sink.
    pub fn responder(mut self, responder: ErrorResponder) -> Self {
        self.responder = responder;
        self
    }

    /// A handle to this server's coordinator, for health probes or to start
    /// a shutdown from elsewhere.
    pub fn coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    /// Serves until SIGTERM or Ctrl-C, then drains.
    pub async fn serve(self, router: Router) -> Result<StopReason, Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Serves until `signal` resolves (or the coordinator starts draining for
    /// another reason), then drains.
    ///
    /// Returns only after the coordinator reached `Stopped`.
    pub async fn serve_with_shutdown<F>(self, router: Router, signal: F) -> Result<StopReason, Error>
    where
        F: Future<Output = ()>,
    {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };
        let coordinator = self.coordinator;

        // One `Arc` shared by every connection task, so the routing table is
        // never copied.
        let shared = Arc::new(Shared {
            router,
            responder: self.responder,
            coordinator: coordinator.clone(),
        });

        info!(addr = %listener.local_addr()?, "quiesce listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them, or abort them, once the coordinator stops.
        let mut tasks = JoinSet::new();
        let mut phase = coordinator.subscribe();

        // A future must not move in memory after its first poll; that is what
        // `Pin` enforces. `tokio::pin!` pins `signal` on the stack so the loop
        // can poll it by reference.
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // `biased` checks arms top to bottom instead of randomly, so a
                // SIGTERM stops accepting even if more connections are queued.
                biased;

                () = &mut signal => {
                    info!(
                        in_flight = coordinator.active_requests(),
                        connections = tasks.len(),
                        "shutdown signal received"
                    );
                    break;
                }

                _ = phase.wait_for(|p| *p != Phase::Running) => {
                    info!(connections = tasks.len(), "coordinator left running, closing listener");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    tasks.spawn(serve_connection(Arc::clone(&shared), stream, remote_addr));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(listener);
        coordinator.begin_shutdown();
        let reason = coordinator.stopped().await;

        if reason == StopReason::Drained {
            // Connections were told to close after their current exchange.
            let closed = tokio::time::timeout(coordinator.drain_timeout(), join_all(&mut tasks)).await;
            if closed.is_err() {
                warn!(connections = tasks.len(), "connections still open after drain, aborting");
            }
        } else {
            warn!(connections = tasks.len(), "aborting connections still open after drain timeout");
        }
        tasks.abort_all();
        join_all(&mut tasks).await;

        info!(%reason, "quiesce stopped");
        Ok(reason)
    }
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while tasks.join_next().await.is_some() {}
}

// ── Connections ───────────────────────────────────────────────────────────────

/// Drives one connection until the peer closes it or, once draining starts,
/// until hyper finishes the exchange in progress.
async fn serve_connection(shared: Arc<Shared>, stream: tokio::net::TcpStream, remote_addr: SocketAddr) {
    let mut phase = shared.coordinator.subscribe();

    // `service_fn` turns a plain async closure into a hyper `Service`. It is
    // called once per request on the connection, not once per connection.
    let svc = service_fn(move |req| {
        let shared = Arc::clone(&shared);
        async move { dispatch(shared, req, remote_addr).await }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates.
    // TokioIo adapts tokio's AsyncRead/AsyncWrite to the hyper IO traits.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    // Pinned so `graceful_shutdown` can be called on it between polls.
    tokio::pin!(conn);

    let mut closing = false;
    loop {
        tokio::select! {
            res = conn.as_mut() => {
                if let Err(e) = res {
                    debug!(peer = %remote_addr, "connection error: {e}");
                }
                return;
            }
            _ = phase.wait_for(|p| *p != Phase::Running), if !closing => {
                closing = true;
                conn.as_mut().graceful_shutdown();
            }
        }
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Routes one request and produces exactly one response.
///
/// The error type is [`Infallible`]: every failure becomes a response here,
/// so hyper never sees an error.
async fn dispatch(
    shared: Arc<Shared>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let started = Instant::now();
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_owned();

    let route = shared.router.lookup(&method, &path);

    // Unmatched requests count too; only probes skip the coordinator.
    let tracked = route.as_ref().is_none_or(|r| r.tracked);
    let _in_flight = match admit(&shared.coordinator, tracked) {
        Ok(guard) => guard,
        Err(unavailable) => {
            debug!(%method, %path, peer = %remote_addr, "rejected while shutting down");
            return Ok(unavailable.into_inner());
        }
    };

    let outcome = match route {
        None => Err(FailureRecord::not_found(format!("no route for {method} {path}"))),
        Some(route) => match body.collect().await {
            Ok(collected) => {
                let req = Request::new(parts, collected.to_bytes(), route.params);
                // A panicking handler must still produce a response and drop
                // its in-flight guard.
                match AssertUnwindSafe(route.handler.call(req)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        Err(FailureRecord::internal("").with_cause(HandlerPanic(panic_message(payload.as_ref()))))
                    }
                }
            }
            Err(e) => Err(FailureRecord::validation("could not read request body").with_cause(e)),
        },
    };

    let mut slot = ResponseSlot::new();
    let answered = match outcome {
        Ok(response) => slot.send(response),
        Err(failure) => shared.responder.respond(&mut slot, failure),
    };
    if let Err(e) = answered {
        error!(target: "quiesce::bug", %method, %path, "dispatch could not answer: {e}");
    }

    let response = slot
        .take()
        .unwrap_or_else(|| Response::error(StatusCode::INTERNAL_SERVER_ERROR, GENERIC_MESSAGE));

    debug!(
        %method,
        %path,
        status = response.status_code().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request complete"
    );
    Ok(response.into_inner())
}

/// Cause attached to the failure a panicking handler turns into.
#[derive(Debug, thiserror::Error)]
#[error("handler panicked: {0}")]
struct HandlerPanic(String);

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Registers a tracked request with the coordinator, or builds the `503` that
/// replaces it once draining has started.
fn admit(coordinator: &ShutdownCoordinator, tracked: bool) -> Result<Option<InFlight>, Response> {
    if !tracked {
        return Ok(None);
    }
    coordinator
        .track()
        .map(Some)
        .map_err(|_| Response::error(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable"))
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by `kubectl` and the
/// Kubernetes control plane) and **SIGINT** (Ctrl-C, for local dev).
/// On Windows only Ctrl-C is available. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` is a future that never resolves: on non-Unix platforms the
    // SIGTERM arm is effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => {}
        () = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admit_counts_tracked_requests() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));

        let guard = admit(&coordinator, true).unwrap();
        assert!(guard.is_some());
        assert_eq!(coordinator.active_requests(), 1);

        assert!(admit(&coordinator, false).unwrap().is_none());
        assert_eq!(coordinator.active_requests(), 1);
    }

    #[tokio::test]
    async fn admit_fast_fails_while_draining() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let _held = coordinator.track().unwrap();
        coordinator.begin_shutdown();

        let res = admit(&coordinator, true).unwrap_err();
        assert_eq!(res.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(res.body(), br#"{"error":"Service Unavailable"}"#);

        // Probes still get through.
        assert!(admit(&coordinator, false).is_ok());
        assert_eq!(coordinator.active_requests(), 1);
    }

    #[test]
    fn from_config_rejects_a_zero_drain() {
        let config = Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            drain_timeout: crate::EnvMsDuration(Duration::ZERO),
        };
        assert!(matches!(Server::from_config(&config), Err(Error::Config(_))));
    }

    #[test]
    fn drain_timeout_keeps_earlier_coordinator_handles() {
        let server = Server::bind("127.0.0.1:0");
        let early = server.coordinator();

        let server = server.drain_timeout(Duration::from_millis(250));
        assert_eq!(early.drain_timeout(), Duration::from_millis(250));

        early.begin_shutdown();
        assert_eq!(server.coordinator().phase(), Phase::Stopped);
    }

    #[test]
    fn panic_messages_are_extracted() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("bad id {}", 7));
        let other: Box<dyn Any + Send> = Box::new(7_u8);

        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(formatted.as_ref()), "bad id 7");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn from_config_applies_the_drain_timeout() {
        let config = Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            drain_timeout: crate::EnvMsDuration(Duration::from_millis(1500)),
        };
        let server = Server::from_config(&config).unwrap();
        assert_eq!(server.coordinator().drain_timeout(), Duration::from_millis(1500));
    }
}
