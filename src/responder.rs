//! Centralized error responses.
//!
//! Every request gets one [`ResponseSlot`]. Handlers fill it with a normal
//! response; failures go through the [`ErrorResponder`], which fills it with a
//! JSON error body:
//!
//! ```text
//! FailureRecord { kind, message, status, cause }
//!        │
//!        ├── cause ──▶ DiagnosticSink (log only, errors and panics ignored)
//!        │
//!        └── status + message ──▶ {"error": "..."} ──▶ ResponseSlot
//! ```
//!
//! The slot accepts exactly one response. A second write is a bug in the
//! caller and comes back as [`Error::AlreadyResponded`]; the first response
//! stays as it was.

use std::error::Error as StdError;
use std::fmt::Write as _;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::failure::{Cause, FailureKind, FailureRecord};
use crate::response::{IntoResponse, Response};

/// Body message used when a failure carries an empty one.
pub const GENERIC_MESSAGE: &str = "Internal Server Error";

// ── ResponseSlot ──────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Open,
    Filled(Response),
    Taken,
}

/// The in-flight response of one request. Holds at most one answer.
#[derive(Debug, Default)]
pub struct ResponseSlot {
    state: SlotState,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` once anything was sent, even if it has since been taken.
    pub fn is_answered(&self) -> bool {
        !matches!(self.state, SlotState::Open)
    }

    /// Stores the answer for this request.
    pub fn send(&mut self, response: impl IntoResponse) -> Result<(), Error> {
        self.ensure_open()?;
        self.state = SlotState::Filled(response.into_response());
        Ok(())
    }

    pub fn response(&self) -> Option<&Response> {
        match &self.state {
            SlotState::Filled(res) => Some(res),
            _ => None,
        }
    }

    /// Hands the answer to the connection. The slot stays answered.
    pub fn take(&mut self) -> Option<Response> {
        match std::mem::replace(&mut self.state, SlotState::Taken) {
            SlotState::Filled(res) => Some(res),
            SlotState::Open => {
                self.state = SlotState::Open;
                None
            }
            SlotState::Taken => None,
        }
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_answered() {
            error!(target: "quiesce::bug", "second response for a request that was already answered");
            return Err(Error::AlreadyResponded);
        }
        Ok(())
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// What a [`DiagnosticSink`] receives for a failure with a cause.
pub struct Diagnostic<'a> {
    pub kind: FailureKind,
    pub status: StatusCode,
    pub message: &'a str,
    pub cause: &'a (dyn StdError + Send + Sync + 'static),
}

/// Destination for the internal side of a failure.
///
/// A sink error never affects the response; it is logged and dropped.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, diagnostic: &Diagnostic<'_>) -> Result<(), Cause>;
}

/// Default sink: one `tracing` error event per failure, with the full cause
/// chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn record(&self, d: &Diagnostic<'_>) -> Result<(), Cause> {
        error!(
            kind = %d.kind,
            status = d.status.as_u16(),
            detail = d.message,
            cause = %cause_chain(d.cause),
            "request failed"
        );
        Ok(())
    }
}

/// `outer: inner: root` rendering of an error and its sources.
pub(crate) fn cause_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let _ = write!(out, ": {inner}");
        source = inner.source();
    }
    out
}

// ── ErrorResponder ────────────────────────────────────────────────────────────

/// Turns a [`FailureRecord`] into the request's single error response.
///
/// ```rust
/// use quiesce::{ErrorResponder, FailureRecord, ResponseSlot};
///
/// let responder = ErrorResponder::default();
/// let mut slot = ResponseSlot::new();
///
/// responder.respond(&mut slot, FailureRecord::not_found("no such user")).unwrap();
/// assert_eq!(slot.response().unwrap().status_code().as_u16(), 404);
///
/// // One answer per request.
/// assert!(responder.respond(&mut slot, FailureRecord::internal("")).is_err());
/// ```
#[derive(Clone)]
pub struct ErrorResponder {
    sink: Arc<dyn DiagnosticSink>,
}

impl ErrorResponder {
    pub fn new(sink: impl DiagnosticSink + 'static) -> Self {
        Self { sink: Arc::new(sink) }
    }

    /// Fills `slot` with the error response for `failure`.
    ///
    /// Only fails when `slot` was already answered. The cause is recorded
    /// before the response is stored.
    pub fn respond(&self, slot: &mut ResponseSlot, failure: FailureRecord) -> Result<(), Error> {
        slot.ensure_open()?;

        let (kind, message, status, cause) = failure.into_parts();
        match &cause {
            Some(cause) => self.record(&Diagnostic { kind, status, message: &message, cause: &**cause }),
            None => debug!(%kind, status = status.as_u16(), detail = %message, "request failed"),
        }

        let message = if message.is_empty() { GENERIC_MESSAGE } else { message.as_str() };
        slot.send(Response::error(status, message))
    }

    fn record(&self, diagnostic: &Diagnostic<'_>) {
        match catch_unwind(AssertUnwindSafe(|| self.sink.record(diagnostic))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "diagnostic sink failed, cause not recorded"),
            Err(_) => warn!("diagnostic sink panicked, cause not recorded"),
        }
    }
}

impl Default for ErrorResponder {
    fn default() -> Self {
        Self::new(TracingSink)
    }
}

impl std::fmt::Debug for ErrorResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorResponder").finish_non_exhaustive()
    }
}
