use std::time::Duration;

use csbus_message::{CodecError, OpID, ServiceID};

/// Errors surfaced by the service layer.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// A blocking call did not complete within the given window.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The target service is not currently available.
    #[error("service `{0}` is unavailable")]
    ServiceUnavailable(ServiceID),

    /// The server endpoint could not be reached at all.
    #[error("server endpoint is unreachable")]
    ServerUnavailable,

    /// A request arrived for an operation with no registered handler.
    #[error("no handler registered for operation `{0}`")]
    HandlerNotFound(OpID),

    /// An address, service, or handler slot is already taken.
    #[error("duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// A component handle no longer resolves to a live component.
    #[error("component is no longer registered")]
    ComponentGone,

    /// The provider answered the request, but with a failure outcome.
    #[error("request for operation `{0}` failed on the provider side")]
    RequestFailed(OpID),

    /// The referenced action is unknown, already finished, or invalid.
    #[error("unknown or already completed action")]
    UnknownAction,

    /// Payload encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
