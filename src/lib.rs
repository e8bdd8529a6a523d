//! haystack-client - Project Haystack client library
//!
//! An asynchronous client for Project Haystack building-automation servers.
//!
//! # Features
//!
//! - **Operations as state machines** - every server interaction is an
//!   explicit, table-validated FSM driven by a tokio task
//! - **Result handles** - block, `await`, or subscribe on any operation's
//!   [`OpHandle`]
//! - **Shared grid cache** - identical in-flight reads collapse onto one
//!   network request
//! - **Vendor logins** - SCRAM-SHA-256 challenge/response, OAuth2 bearer
//!   tokens, and cookie/digest handshakes, all single-flight
//! - **Pluggable transport and codec** - bring your own HTTP client or
//!   grid encoding
#![forbid(unsafe_code)]

/// Completion primitive, state machine engine, and the error taxonomy
pub mod core;
/// Grid data model, scalars, and wire codecs
pub mod grid;
/// HTTP transport seam and the reqwest-backed implementation
pub mod http;
/// Operation framework: grid, entity, history and feature operations
pub mod op;
/// Session façade and configuration
pub mod session;

/// Vendor authentication machines and credential state
pub mod auth;

// Root re-exports: the types most callers touch.

pub use crate::auth::{AuthMethod, Credentials};
pub use crate::core::{
    ContractError, Error, OpHandle, OpResult, ProtocolError, Result, TransportError,
};
pub use crate::grid::{Grid, GridCodec, GridFormat, JsonCodec, Meta, Row, Scalar};
pub use crate::http::{HttpRequest, HttpResponse, HttpTransport, Method};
pub use crate::op::{Entity, EntityMap, FeatureMap, GridPayload, HisRange, RetryPolicy};
pub use crate::session::{ConfigError, Session, SessionBuilder, SessionConfig};

/// Commonly used types and traits
pub mod prelude {
    pub use crate::auth::{AuthMethod, Credentials};
    pub use crate::core::{Error, OpHandle, Result};
    pub use crate::grid::{Grid, Scalar};
    pub use crate::op::{Entity, HisRange};
    pub use crate::session::{Session, SessionBuilder};
}
