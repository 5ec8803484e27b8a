//! Unified error type for the Memory Feast server.

use feast_protocol::{ErrorCode, ProtocolError};
use feast_room::RoomError;
use feast_session::StoreError;
use feast_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// Handlers return this and the reader loop turns it into an `error`
/// frame via [`error_code`](Self::error_code).
#[derive(Debug, thiserror::Error)]
pub enum FeastError {
    /// A transport-level error (bind, send, recv).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A frame that could not be decoded or interpreted.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A room refused or could not carry out an operation.
    #[error(transparent)]
    Room(#[from] RoomError),

    /// A request refused by policy, with the code the client should see.
    #[error("{message}")]
    Rejected { code: ErrorCode, message: String },
}

impl FeastError {
    pub fn rejected(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// The wire error code a client should see for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Protocol(e) => e.error_code(),
            Self::Room(RoomError::RoomFull(_)) => ErrorCode::RoomFull,
            Self::Room(RoomError::NotFound(_)) => ErrorCode::RoomNotFound,
            Self::Room(RoomError::Rejected | RoomError::NotTwoSelected) => {
                ErrorCode::InvalidAction
            }
            Self::Rejected { code, .. } => *code,
            Self::Transport(_) | Self::Store(_) | Self::Room(_) => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feast_protocol::RoomId;

    #[test]
    fn test_from_transport_error() {
        let err = TransportError::ConnectionClosed("gone".into());
        let feast_err: FeastError = err.into();
        assert!(matches!(feast_err, FeastError::Transport(_)));
        assert!(feast_err.to_string().contains("gone"));
        assert_eq!(feast_err.error_code(), ErrorCode::Internal);
    }

    #[test]
    fn test_from_protocol_error_keeps_its_code() {
        let err = ProtocolError::UnknownType("dance".into());
        let feast_err: FeastError = err.into();
        assert!(matches!(feast_err, FeastError::Protocol(_)));
        assert_eq!(feast_err.error_code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_from_store_error() {
        let err = StoreError::Unavailable("down".into());
        let feast_err: FeastError = err.into();
        assert!(matches!(feast_err, FeastError::Store(_)));
        assert_eq!(feast_err.error_code(), ErrorCode::Internal);
    }

    #[test]
    fn test_from_room_error_maps_codes() {
        let full: FeastError = RoomError::RoomFull(RoomId::new("r")).into();
        assert_eq!(full.error_code(), ErrorCode::RoomFull);

        let missing: FeastError = RoomError::NotFound(RoomId::new("r")).into();
        assert_eq!(missing.error_code(), ErrorCode::RoomNotFound);

        let rejected: FeastError = RoomError::Rejected.into();
        assert_eq!(rejected.error_code(), ErrorCode::InvalidAction);

        let exhausted: FeastError = RoomError::CodeSpaceExhausted(32).into();
        assert_eq!(exhausted.error_code(), ErrorCode::Internal);
    }

    #[test]
    fn test_rejected_carries_code_and_message() {
        let err = FeastError::rejected(ErrorCode::InvalidNickname, "too long");
        assert_eq!(err.error_code(), ErrorCode::InvalidNickname);
        assert_eq!(err.to_string(), "too long");
    }
}
