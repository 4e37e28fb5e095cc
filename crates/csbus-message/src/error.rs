use crate::ids::OpID;

/// Errors that can occur while encoding or decoding payloads and envelopes.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The envelope's operation id does not match the expected payload type.
    #[error("operation id mismatch (expected `{expected}`, got `{actual}`)")]
    OperationIdMismatch { expected: OpID, actual: OpID },

    /// A payload was expected but the message carries no content.
    #[error("message for `{0}` carries no content")]
    EmptyContent(OpID),

    /// Payload decoding failed.
    #[error("failed to decode payload for `{op_id}`: {source}")]
    Decode {
        op_id: OpID,
        #[source]
        source: serde_json::Error,
    },

    /// Payload encoding failed.
    #[error("failed to encode payload for `{op_id}`: {source}")]
    Encode {
        op_id: OpID,
        #[source]
        source: serde_json::Error,
    },

    /// The message envelope itself could not be decoded from wire bytes.
    #[error("malformed message envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CodecError>;
