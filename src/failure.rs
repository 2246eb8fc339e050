//! Request-level failures.
//!
//! A [`FailureRecord`] is created where something goes wrong (input
//! validation, a missing row, a downstream call) and moved into the
//! [`ErrorResponder`](crate::ErrorResponder), which turns it into exactly one
//! response. It is consumed there and never outlives the request.

use std::error::Error as StdError;
use std::fmt;

use http::StatusCode;

/// Boxed lower-level error kept for diagnostics only.
pub type Cause = Box<dyn StdError + Send + Sync + 'static>;

/// Broad classification of a request failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureKind {
    /// The client sent something we cannot accept (4xx).
    Validation,
    /// The addressed resource does not exist (usually 404).
    NotFound,
    /// Anything else. Defaults to 500.
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound   => "not_found",
            Self::Internal   => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One captured failure, destined for a client-facing error response.
///
/// # Example
///
/// ```rust
/// use quiesce::{FailureKind, FailureRecord};
///
/// let failure = FailureRecord::validation("name must not be empty")
///     .with_status(422);
/// assert_eq!(failure.kind(), FailureKind::Validation);
/// assert_eq!(failure.resolved_status().as_u16(), 422);
///
/// let io = std::io::Error::other("connection reset");
/// let failure = FailureRecord::internal("").with_cause(io);
/// assert_eq!(failure.resolved_status().as_u16(), 500);
/// ```
pub struct FailureRecord {
    kind: FailureKind,
    message: String,
    status: Option<u16>,
    cause: Option<Cause>,
}

impl FailureRecord {
    /// A failure with no status set. It resolves to `500`.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), status: None, cause: None }
    }

    /// `400 Bad Request`, unless overridden with [`with_status`](Self::with_status).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Validation, message).with_status(400)
    }

    /// `404 Not Found`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NotFound, message).with_status(404)
    }

    /// Internal failure. An empty message is replaced by a generic one on the
    /// wire.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Internal, message)
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attaches the underlying error. It is logged, never sent to the client.
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn kind(&self) -> FailureKind { self.kind }
    pub fn message(&self) -> &str { &self.message }

    /// The status as supplied, possibly unset or out of range.
    pub fn status(&self) -> Option<u16> { self.status }

    pub fn cause(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.cause.as_deref()
    }

    /// The status that will actually be sent.
    ///
    /// Unset and malformed values (anything outside `400..=599`) become `500`.
    pub fn resolved_status(&self) -> StatusCode {
        self.status
            .filter(|s| (400..=599).contains(s))
            .and_then(|s| StatusCode::from_u16(s).ok())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub(crate) fn into_parts(self) -> (FailureKind, String, StatusCode, Option<Cause>) {
        let status = self.resolved_status();
        (self.kind, self.message, status, self.cause)
    }
}

// Never prints the cause, only whether there is one.
impl fmt::Debug for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailureRecord")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("status", &self.status)
            .field("has_cause", &self.cause.is_some())
            .finish()
    }
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure ({}): {}", self.kind, self.resolved_status().as_u16(), self.message)
    }
}
