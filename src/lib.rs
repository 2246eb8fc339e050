//! # quiesce
//!
//! Request-error responses and graceful shutdown for HTTP services behind a
//! reverse proxy.
//!
//! ## The contract
//!
//! Two pieces of lifecycle glue, independent of each other:
//!
//! - **[`ErrorResponder`]**: every failure a handler returns becomes exactly
//!   one JSON response, `{"error": "..."}`, with the failure's status (500
//!   when unset or malformed). The underlying cause goes to a
//!   [`DiagnosticSink`] and never to the client. Answering a request twice is
//!   a bug and is reported as [`Error::AlreadyResponded`].
//! - **[`ShutdownCoordinator`]**: counts in-flight requests. On SIGTERM it
//!   stops admitting new work, lets running requests finish, and reports
//!   `Stopped` once, when the last one completes or the drain timeout expires.
//!
//! The [`Server`], [`Router`] and [`health`] probes are the host both attach
//! to: a hyper connection loop and a radix-tree router, nothing more.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use quiesce::{FailureRecord, Request, Response, Router, Server, health};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), quiesce::Error> {
//!     let server = Server::bind("0.0.0.0:3000");
//!     let shutdown = server.coordinator();
//!
//!     let app = Router::new()
//!         .get("/users/{id}", get_user)
//!         .probe("/healthz", health::liveness(shutdown.clone()))
//!         .probe("/readyz", health::readiness(shutdown));
//!
//!     let reason = server.serve(app).await?;
//!     println!("stopped: {reason}");
//!     Ok(())
//! }
//!
//! async fn get_user(req: Request) -> Result<Response, FailureRecord> {
//!     let id: u64 = req
//!         .param("id")
//!         .and_then(|id| id.parse().ok())
//!         .ok_or_else(|| FailureRecord::validation("id must be a number"))?;
//!     if id != 42 {
//!         return Err(FailureRecord::not_found(format!("no user {id}")));
//!     }
//!     Ok(Response::json(format!(r#"{{"id":{id}}}"#)))
//! }
//! ```

mod config;
mod error;
mod failure;
mod handler;
mod request;
mod responder;
mod response;
mod router;
mod server;
mod shutdown;

pub mod health;

#[cfg(test)]
mod test_support;

pub use config::{Config, EnvMsDuration, ParseEnvMsDurationError};
pub use error::Error;
pub use failure::{Cause, FailureKind, FailureRecord};
pub use handler::Handler;
pub use request::Request;
pub use responder::{Diagnostic, DiagnosticSink, ErrorResponder, GENERIC_MESSAGE, ResponseSlot, TracingSink};
pub use response::{IntoOutcome, IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::{DEFAULT_DRAIN_TIMEOUT, Server};
pub use shutdown::{InFlight, Phase, ShutdownCoordinator, StopReason};
