//! Kubernetes health-check handlers driven by the shutdown phase.
//!
//! | Probe | Running | Draining | Stopped |
//! |---|---|---|---|
//! | **Liveness** (`/healthz`) | 200 | 200 | 503 |
//! | **Readiness** (`/readyz`) | 200 | 503 | 503 |
//!
//! A draining pod is still alive (it is finishing work, do not restart it)
//! but not ready (stop routing new traffic to it).
//!
//! ```rust,no_run
//! use quiesce::{Router, Server, health};
//!
//! # async fn run() -> Result<(), quiesce::Error> {
//! let server = Server::bind("0.0.0.0:3000");
//! let shutdown = server.coordinator();
//!
//! let app = Router::new()
//!     .probe("/healthz", health::liveness(shutdown.clone()))
//!     .probe("/readyz", health::readiness(shutdown));
//!
//! server.serve(app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! Routes registered with [`Router::probe`](crate::Router::probe) bypass the
//! in-flight count, so they keep answering while the server drains.

use http::StatusCode;

use crate::handler::Handler;
use crate::request::Request;
use crate::response::Response;
use crate::shutdown::{Phase, ShutdownCoordinator};

/// Liveness probe: `200 ok` until the coordinator stops.
pub fn liveness(shutdown: ShutdownCoordinator) -> impl Handler {
    move |_req: Request| {
        let phase = shutdown.phase();
        async move { probe(phase != Phase::Stopped, "ok", phase) }
    }
}

/// Readiness probe: `200 ready` only while running.
pub fn readiness(shutdown: ShutdownCoordinator) -> impl Handler {
    move |_req: Request| {
        let phase = shutdown.phase();
        async move { probe(phase == Phase::Running, "ready", phase) }
    }
}

fn probe(healthy: bool, body: &'static str, phase: Phase) -> Response {
    if healthy {
        Response::text(body)
    } else {
        Response::builder()
            .status(StatusCode::SERVICE_UNAVAILABLE)
            .text(phase.as_str())
    }
}
