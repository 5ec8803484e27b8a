//! Error types for the protocol layer.

use crate::ErrorCode;

/// Errors that can occur while encoding or interpreting messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// The frame is not a JSON envelope.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The envelope names a message type the server does not know.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The envelope is well-formed but its payload does not fit the type.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// The wire error code a client should see for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Encode(_) => ErrorCode::Internal,
            Self::Decode(_) | Self::InvalidPayload { .. } => ErrorCode::InvalidPayload,
            Self::UnknownType(_) => ErrorCode::InvalidMessage,
        }
    }
}
