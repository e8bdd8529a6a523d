//! Error taxonomy for client operations.
//!
//! Every failure an operation can deliver falls into one of four kinds:
//! transport (retryable), protocol (the server rejected the request),
//! authentication (fatal for the triggering operation), and contract
//! (a caller or implementation bug). Retry decisions are made purely from
//! the kind, never from string matching.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the operation framework.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level operation error.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Network-level failure; retried up to the operation's budget.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server explicitly rejected the request; never retried.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Authentication failed; fatal for the triggering operation and not
    /// subject to the generic retry budget.
    #[error("authentication problem: {reason}")]
    Auth { reason: String },

    /// Programming or contract violation; propagates immediately.
    #[error(transparent)]
    Contract(#[from] ContractError),
}

impl Error {
    /// Whether the failed operation may be re-submitted.
    ///
    /// Only transport errors are retryable: a protocol error means the
    /// server understood and refused the request, an auth error needs a
    /// fresh login (or better credentials), and a contract error is a bug.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub(crate) fn auth(reason: impl Into<String>) -> Self {
        Error::Auth {
            reason: reason.into(),
        }
    }
}

/// Transport-level failure variants.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    /// Connection could not be established (refused, DNS, TLS, ...).
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The request did not complete in time.
    #[error("request timed out after {after:?}")]
    Timeout { after: Duration },

    /// HTTP status outside 2xx and not in the operation's accept list.
    #[error("unexpected HTTP status {status}")]
    Status { status: u16 },
}

/// Protocol-level failure variants.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// In-band `err` marker in a decoded grid's metadata.
    #[error("server error: {dis}")]
    Server {
        dis: String,
        traceback: Option<String>,
    },

    /// The response body's content type is not a grid encoding we know.
    #[error("unrecognised content type {content_type:?}")]
    UnrecognizedContentType { content_type: String },

    /// The body claimed to be a grid but could not be decoded.
    #[error("malformed grid: {message}")]
    Malformed { message: String },

    /// An entity lookup matched nothing.
    #[error("no matching entity found")]
    NotFound,
}

/// Caller/implementation bugs. Not retried, not caught.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContractError {
    /// `result()` was called before the operation completed.
    #[error("operation result accessed before completion")]
    NotReady,

    /// An event was fired from a state that does not define it.
    #[error("no transition for event {event} in state {state}")]
    IllegalTransition { event: String, state: String },

    /// The transition table declares the same (event, from-state) twice.
    #[error("ambiguous transition table: duplicate entry for ({event}, {state})")]
    DuplicateTransition { event: String, state: String },

    /// An argument combination the API forbids.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
}
