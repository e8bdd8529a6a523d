//! Core primitives: error taxonomy, completion cell, state machine engine.

mod completion;
mod error;
mod machine;

pub use completion::{OpHandle, OpResult};
pub use error::{ContractError, Error, ProtocolError, Result, TransportError};
pub use machine::{StateMachine, Transition};
