use serde::{Deserialize, Serialize};

/// Kind of a client-server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpCode {
    /// A request (RPC call) directed at a provider.
    Request,
    /// The provider's answer to a `Request`.
    Response,
    /// Subscribe to a cached property.
    RegisterStatus,
    /// Drop a property subscription.
    UnregisterStatus,
    /// Subscribe to a fire-and-forget signal.
    RegisterSignal,
    /// Drop a signal subscription.
    UnregisterSignal,
    /// A property change pushed to subscribers.
    StatusUpdate,
    /// A signal pushed to subscribers; never cached.
    SignalBroadcast,
    /// Cancel an in-flight request without expecting a response.
    AbortRequest,
    /// Availability transition of a server connection or service.
    ServerStatusChanged,
}

impl OpCode {
    /// Whether this code starts a subscription.
    pub fn is_register(self) -> bool {
        matches!(self, OpCode::RegisterStatus | OpCode::RegisterSignal)
    }

    /// The unregister code paired with a register code, if any.
    pub fn unregister_pair(self) -> Option<OpCode> {
        match self {
            OpCode::RegisterStatus => Some(OpCode::UnregisterStatus),
            OpCode::RegisterSignal => Some(OpCode::UnregisterSignal),
            _ => None,
        }
    }
}

/// Reachability of a server connection or, derived from it, of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Availability {
    #[default]
    Unavailable,
    Available,
}

impl Availability {
    pub fn is_available(self) -> bool {
        self == Availability::Available
    }
}
