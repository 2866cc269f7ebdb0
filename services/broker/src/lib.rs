//! # Federation Broker
//!
//! ## Purpose
//! Store-and-forward bridge between a management collective (a local fleet on
//! one pub/sub bus) and a federation of such collectives on another. Two
//! cooperating processors consume from their own side, rewrite the federation
//! headers that keep request/reply correlation intact, and hand routing
//! instructions across to the peer for publication.
//!
//! ## Architecture Role
//! ```text
//! collective bus ──▶ CollectiveProcessor ──queue──▶ FederationProcessor ──▶ federation bus
//! collective bus ◀── CollectiveProcessor ◀──queue── FederationProcessor ◀── federation bus
//! ```
//!
//! Everything runs on supervised OS threads. The broker has no synchronous
//! error channel back to senders: reliability comes from retry, requeue, and
//! self-healing reconnection, observed through the stats service.

pub mod broker;
pub mod config;
pub mod processor;
pub mod registry;
pub mod stats;
pub mod supervisor;

pub use broker::FederationBroker;
pub use config::{BrokerConfig, SideConfig, TlsSettings};
pub use processor::{
    CollectiveLogic, FederationLogic, Processor, ProcessorLogic, ProcessorStats,
};
pub use registry::ThreadRegistry;
pub use stats::{StatsObserver, StatsService};
pub use supervisor::{supervise, Supervised};

/// Broker-level errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker thread {0} is already registered")]
    DuplicateThread(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Seconds since the unix epoch
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
