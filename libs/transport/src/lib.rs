//! # Pub/Sub Transport Layer
//!
//! ## Purpose
//! Wraps an async publish/subscribe wire client behind the blocking API the
//! rest of the broker is written against. Each adapter owns exactly one
//! network connection, one subscription table, and its reconnect backoff; the
//! consuming side sees a pull-model `receive()` and nothing else.
//!
//! ## Architecture Role
//! ```text
//! Processor thread            Adapter runtime            Bus
//!   receive() ◀── channel ◀── reader task ◀── frames ◀── server
//!   publish() ──▶ writer half ───────────────frames ───▶ server
//! ```
//!
//! The reader task heals the connection on any fault: capped backoff, redial
//! the endpoint list, replay every recorded subscription, resume delivery.
//! Callers never observe reconnection except as a temporary publish failure.

pub mod adapter;
pub mod backoff;
pub mod testing;
pub mod wire;

pub use adapter::{NetConnector, TransportAdapter, TransportOptions};
pub use backoff::BackoffPolicy;
pub use wire::{ClientFrame, ServerFrame, MAX_FRAME_SIZE};

use std::sync::Arc;

/// Transport-level errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("Not connected to any server")]
    Disconnected,

    #[error("Transport stopped")]
    Stopped,

    #[error("Transport configuration error: {0}")]
    Config(String),
}

/// Result type for transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// An inbound message delivered by a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub subject: String,
    pub reply_to: Option<String>,
    pub payload: Vec<u8>,
}

/// Sentinel reported by `connected_server` while no connection is live
pub const DISCONNECTED: &str = "disconnected";

/// Blocking connection contract used by every broker component.
///
/// `receive()` is the sole blocking primitive: it parks the calling thread
/// until a subscribed message arrives or the connection is stopped.
pub trait Connection: Send + Sync {
    /// Register interest in a subject. Idempotent: a second call for the same
    /// subject is a no-op. Errors surface to the caller, which retries.
    fn subscribe(&self, subject: &str, queue_group: Option<&str>) -> TransportResult<()>;

    /// Block until one subscribed message is available
    fn receive(&self) -> TransportResult<WireMessage>;

    /// Publish a payload to a subject
    fn publish(
        &self,
        subject: &str,
        payload: &[u8],
        reply_to: Option<&str>,
    ) -> TransportResult<()>;

    /// Currently connected peer address, or [`DISCONNECTED`]
    fn connected_server(&self) -> String;

    /// Drop the live connection so the next receive goes through a full
    /// reconnect. A no-op when already disconnected or stopped.
    fn force_reconnect(&self);

    /// Close the connection and suppress any further reconnect attempts
    fn stop(&self);
}

/// Factory for blocking connections. `connect` may block and retry
/// indefinitely; it only fails once the transport has been stopped.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> TransportResult<Arc<dyn Connection>>;
}
