//! # Message Envelope - Federation Header Model
//!
//! ## Purpose
//! Typed view over the JSON envelopes relayed between a collective and the
//! federation. Only the `headers` block is modeled; every other field is
//! captured in a flattened map and re-serialized verbatim.
//!
//! ## Integration Points
//! - **Processors**: rewrite `reply-to` / `federation.reply-to` on the way
//!   through the bridge and append `seen-by` hop records
//! - **Transport**: envelopes travel as opaque JSON bytes; this module is the
//!   only place they are decoded
//!
//! ## Wire Shape
//! ```json
//! {
//!   "headers": {
//!     "federation": { "req": "...", "target": ["..."], "reply-to": "..." },
//!     "reply-to": "...",
//!     "seen-by": [ ["nats1:4222", "prod:fed1", "nats2:4222"] ]
//!   },
//!   "...": "opaque payload fields"
//! }
//! ```

use crate::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One hop record appended by a broker instance a traceable message passes
/// through: `[inbound_server, "<cluster>:<instance>", outbound_server]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenByHop(pub String, pub String, pub String);

impl SeenByHop {
    pub fn new(
        inbound: impl Into<String>,
        via: impl Into<String>,
        outbound: impl Into<String>,
    ) -> Self {
        Self(inbound.into(), via.into(), outbound.into())
    }
}

/// The `headers.federation` block carried by every federated message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationHeader {
    /// Request identifier, preserved end to end for correlation
    pub req: String,

    /// Destination subjects inside the target collective (fan-out point)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<String>>,

    /// Reply address stashed for the trip back through federation
    #[serde(rename = "reply-to", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Unrecognized federation fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Envelope headers inspected by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<FederationHeader>,

    /// Current reply address on the local side of the bridge
    #[serde(rename = "reply-to", default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,

    /// Hop trace, present only on traceable requests. A missing key means
    /// tracing is disabled for this message and must stay disabled.
    #[serde(rename = "seen-by", default, skip_serializing_if = "Option::is_none")]
    pub seen_by: Option<Vec<SeenByHop>>,

    /// Unrecognized header fields, preserved verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Headers {
    /// Append a hop record when this message is traceable. Existing entries
    /// are never mutated and the trace is never initialized here.
    pub fn record_seen(&mut self, hop: SeenByHop) {
        if let Some(seen) = self.seen_by.as_mut() {
            seen.push(hop);
        }
    }
}

/// A complete message envelope. Payload fields are opaque to the broker and
/// round-trip byte-for-byte through `body`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Headers>,

    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Envelope {
    /// Decode an envelope from raw JSON bytes
    pub fn from_slice(data: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Serialize back to the wire representation
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Headers, or an error for envelopes that never should have reached a
    /// processor
    pub fn headers(&self) -> ProtocolResult<&Headers> {
        self.headers.as_ref().ok_or(ProtocolError::MissingHeaders)
    }

    pub fn headers_mut(&mut self) -> ProtocolResult<&mut Headers> {
        self.headers.as_mut().ok_or(ProtocolError::MissingHeaders)
    }

    /// The federation block, required on every message crossing the bridge
    pub fn federation(&self) -> ProtocolResult<&FederationHeader> {
        self.headers()?
            .federation
            .as_ref()
            .ok_or(ProtocolError::MissingFederation)
    }

    pub fn federation_mut(&mut self) -> ProtocolResult<&mut FederationHeader> {
        self.headers_mut()?
            .federation
            .as_mut()
            .ok_or(ProtocolError::MissingFederation)
    }

    /// True when the envelope carries a federation block and can be routed
    pub fn is_federated(&self) -> bool {
        self.headers
            .as_ref()
            .map(|h| h.federation.is_some())
            .unwrap_or(false)
    }
}
