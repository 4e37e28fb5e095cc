use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::{CodecError, Result};
use crate::ids::{OpID, ServiceID};
use crate::opcode::{Availability, OpCode};
use crate::payload::Payload;

/// The wire envelope exchanged between service proxies and providers.
///
/// Content is opaque to routing; it is only interpreted by the typed
/// request/response pair on each side, matched by identical [`OpID`]. The
/// `seq` field correlates a `Response` with the `Request` that caused it and
/// is zero for uncorrelated messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub service_id: ServiceID,
    pub op_id: OpID,
    pub op_code: OpCode,
    pub source: Address,
    pub dest: Address,
    pub seq: u64,
    pub content: Option<Bytes>,
}

impl Message {
    /// Create an envelope with invalid addresses, no correlation, and no
    /// content. Callers fill in the rest with struct update syntax.
    pub fn new(service_id: ServiceID, op_id: OpID, op_code: OpCode) -> Self {
        Self {
            service_id,
            op_id,
            op_code,
            source: Address::invalid(),
            dest: Address::invalid(),
            seq: 0,
            content: None,
        }
    }

    /// Build the `Response` answering this message: identifiers and
    /// correlation are preserved, the direction is flipped.
    pub fn to_response(&self, content: Option<Bytes>) -> Message {
        Message {
            service_id: self.service_id.clone(),
            op_id: self.op_id.clone(),
            op_code: OpCode::Response,
            source: self.dest.clone(),
            dest: self.source.clone(),
            seq: self.seq,
            content,
        }
    }

    /// Encode the envelope for a byte-stream transport.
    pub fn to_bytes(&self) -> Result<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(CodecError::MalformedEnvelope)
    }

    /// Decode an envelope received from a byte-stream transport.
    pub fn from_bytes(raw: &[u8]) -> Result<Message> {
        serde_json::from_slice(raw).map_err(CodecError::MalformedEnvelope)
    }
}

/// Availability transition carried by `ServerStatusChanged` messages.
///
/// With an invalid service id the envelope reports a whole endpoint appearing
/// or disappearing; with a valid one it reports a single service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub previous: Availability,
    pub current: Availability,
}

impl StatusChange {
    pub fn new(previous: Availability, current: Availability) -> Self {
        Self { previous, current }
    }
}

impl Payload for StatusChange {
    fn operation_id() -> OpID {
        OpID::from("csbus.status-change")
    }
}
