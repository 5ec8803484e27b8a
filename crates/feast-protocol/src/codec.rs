//! Codec trait and the JSON implementation.
//!
//! A "codec" converts between Rust types and raw bytes. The rest of the
//! server only talks to the [`Codec`] trait, so the wire format is chosen
//! in one place.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// A codec that can encode Rust types to bytes and decode bytes back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed or don't
    /// match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

/// A [`Codec`] backed by `serde_json`. Browsers speak JSON text frames,
/// so this is the only codec the server needs.
///
/// ```rust
/// use feast_protocol::{Codec, Envelope, JsonCodec};
///
/// let codec = JsonCodec;
/// let env: Envelope = codec.decode(br#"{"type":"confirm_match"}"#).unwrap();
/// assert_eq!(env.kind, "confirm_match");
/// assert!(env.payload.is_none());
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode, QueueJoinedPayload, ServerMessage};

    #[test]
    fn test_encode_server_message_is_compact_json() {
        let bytes = JsonCodec
            .encode(&ServerMessage::QueueJoined(QueueJoinedPayload { position: 2 }))
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"type":"queue_joined","payload":{"position":2}}"#
        );
    }

    #[test]
    fn test_decode_garbage_maps_to_invalid_payload() {
        let err = JsonCodec.decode::<crate::Envelope>(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert_eq!(err.error_code(), ErrorCode::InvalidPayload);
    }
}
