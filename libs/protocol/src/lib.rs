//! # Federation Protocol Types
//!
//! Shared data model for the federation broker: the message envelope with its
//! federation headers, the routing instruction handed between processors, and
//! the subject naming scheme used on both buses.
//!
//! The broker never inspects message payloads. Everything outside the
//! `headers` block round-trips through an envelope untouched, so a broker in
//! the middle of a request path cannot corrupt fields it does not understand.

pub mod envelope;
pub mod routing;
pub mod subjects;

pub use envelope::{Envelope, FederationHeader, Headers, SeenByHop};
pub use routing::RoutingInstruction;
pub use subjects::*;

/// Protocol-level errors
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Envelope has no headers")]
    MissingHeaders,

    #[error("Envelope headers have no federation block")]
    MissingFederation,

    #[error("Routing instruction has no targets")]
    EmptyTargets,
}

/// Result type for protocol operations
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;
