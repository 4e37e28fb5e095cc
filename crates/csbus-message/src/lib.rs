//! Message envelope, identifiers, and payload codec for csbus.
//!
//! Every exchange between a service proxy and a service provider travels as a
//! [`Message`]: a small envelope carrying the service and operation
//! identifiers, an [`OpCode`] describing what the message does, source and
//! destination [`Address`]es, a correlation sequence, and an opaque content
//! blob. Routing never inspects the content; only the typed request/response
//! pair on each end interprets it, guarded by the operation-id check in
//! [`decode`].

pub mod address;
pub mod error;
pub mod ids;
pub mod message;
pub mod opcode;
pub mod payload;

pub use address::Address;
pub use error::{CodecError, Result};
pub use ids::{OpID, RegID, ServiceID};
pub use message::{Message, StatusChange};
pub use opcode::{Availability, OpCode};
pub use payload::{decode, encode, Payload};
