//! Out-of-process delivery contract.
//!
//! The routing layer only reaches components inside the current process.
//! When a [`Client`](crate::Client) or [`Server`](crate::Server) has to
//! talk across a process boundary, it serializes the message with
//! [`Message::to_bytes`](csbus_message::Message::to_bytes) and hands the
//! raw frame to an attached `Transport`. The receiving side feeds frames
//! back in through `handle_inbound_bytes`.

use bytes::Bytes;
use csbus_message::{Address, Availability};

/// Outcome of a transport-level operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportStatus {
    /// The frame was handed to the destination.
    Delivered,
    /// The destination exists but did not accept the frame in time.
    Timeout,
    /// No route to the destination.
    Unreachable,
}

impl TransportStatus {
    pub fn is_delivered(self) -> bool {
        matches!(self, TransportStatus::Delivered)
    }
}

/// A byte-level channel to endpoints outside this process.
///
/// Implementations must be safe to call from multiple threads; the
/// service layer never serializes access on their behalf.
pub trait Transport: Send + Sync {
    /// Establish (or verify) a connection to the given endpoint.
    fn init_connection(&self, remote: &Address) -> TransportStatus;

    /// Deliver one serialized message frame to the given endpoint.
    fn send(&self, frame: Bytes, remote: &Address) -> TransportStatus;

    /// Report whether the endpoint is currently reachable.
    fn check_status(&self, remote: &Address) -> Availability;
}
