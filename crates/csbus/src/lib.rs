//! Client-server messaging middleware.
//!
//! csbus connects components through addressed mailboxes and gives them a
//! service vocabulary on top: requests paired back to their responses,
//! properties with cached last values, and fire-and-forget signals.
//!
//! # Crate Structure
//!
//! - [`message`] — The wire vocabulary: addresses, ids, opcodes, envelopes
//! - [`routing`] — Components, the router, and one-shot waiters
//! - [`service`] — Servers, clients, providers, and requesters

pub mod logging;

/// Re-export message types.
pub mod message {
    pub use csbus_message::*;
}

/// Re-export routing types.
pub mod routing {
    pub use csbus_routing::*;
}

/// Re-export service types.
pub mod service {
    pub use csbus_service::*;
}
