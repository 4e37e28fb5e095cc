use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CodecError, Result};
use crate::ids::OpID;

/// A typed message payload tied to one operation.
///
/// Every payload type declares the operation it belongs to; [`decode`] checks
/// that id against the envelope before deserializing, so a callback is never
/// handed wrong-typed data.
pub trait Payload: Serialize + DeserializeOwned {
    /// Stable identifier of the operation this payload belongs to.
    fn operation_id() -> OpID;
}

/// Encode a payload into opaque content bytes.
pub fn encode<P: Payload>(payload: &P) -> Result<Bytes> {
    serde_json::to_vec(payload)
        .map(Bytes::from)
        .map_err(|source| CodecError::Encode {
            op_id: P::operation_id(),
            source,
        })
}

/// Decode message content as `P`, first checking the envelope operation id.
///
/// A mismatch is a [`CodecError::OperationIdMismatch`], never a silent
/// coercion; absent content is [`CodecError::EmptyContent`].
pub fn decode<P: Payload>(op_id: &OpID, content: Option<&Bytes>) -> Result<P> {
    let expected = P::operation_id();
    if *op_id != expected {
        return Err(CodecError::OperationIdMismatch {
            expected,
            actual: op_id.clone(),
        });
    }
    let raw = content.ok_or_else(|| CodecError::EmptyContent(expected.clone()))?;
    serde_json::from_slice(raw).map_err(|source| CodecError::Decode {
        op_id: expected,
        source,
    })
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    impl Payload for Echo {
        fn operation_id() -> OpID {
            OpID::from("test.echo")
        }
    }

    #[test]
    fn encode_decode_roundtrip() {
        let raw = encode(&Echo {
            text: "hello".into(),
        })
        .unwrap();
        let back: Echo = decode(&OpID::from("test.echo"), Some(&raw)).unwrap();
        assert_eq!(back.text, "hello");
    }

    #[test]
    fn mismatched_op_id_is_rejected() {
        let raw = encode(&Echo { text: "x".into() }).unwrap();
        let err = decode::<Echo>(&OpID::from("test.other"), Some(&raw)).unwrap_err();
        assert!(matches!(err, CodecError::OperationIdMismatch { .. }));
    }

    #[test]
    fn empty_content_is_rejected() {
        let err = decode::<Echo>(&OpID::from("test.echo"), None).unwrap_err();
        assert!(matches!(err, CodecError::EmptyContent(_)));
    }

    #[test]
    fn garbage_content_is_a_decode_failure() {
        let raw = Bytes::from_static(b"not json");
        let err = decode::<Echo>(&OpID::from("test.echo"), Some(&raw)).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }
}
