//! Unified error type.

use crate::shutdown::Phase;

/// The error type returned by quiesce's fallible operations.
///
/// Request-level problems (bad input, missing resources, failed downstream
/// calls) are not `Error`s. They are [`FailureRecord`](crate::FailureRecord)s
/// and always end up as an HTTP response. This type covers infrastructure
/// failures and misuse of the request lifecycle by calling code.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Binding the listener or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// A response was already written for this request.
    ///
    /// This is a bug in the caller, never a client-facing condition.
    #[error("already responded to this request")]
    AlreadyResponded,

    /// The coordinator left `Running`; no new requests are admitted.
    #[error("not accepting requests while {0}")]
    NotAccepting(Phase),

    /// An environment variable was unparseable.
    #[error("env: {0}")]
    Env(#[from] envconfig::Error),

    /// Configuration loaded but is out of range.
    #[error("config: {0}")]
    Config(String),
}
