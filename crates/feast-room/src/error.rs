//! Error types for the room layer.

use feast_protocol::{RoomCode, RoomId};

/// Errors that can occur during room, manager, or matchmaking operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// The room does not exist.
    #[error("room {0} not found")]
    NotFound(RoomId),

    /// Both player slots are taken.
    #[error("room {0} is full")]
    RoomFull(RoomId),

    /// Wrong phase, wrong turn, bad index, or a reveal is still pending.
    #[error("action rejected")]
    Rejected,

    /// Confirm was attempted without exactly two plates selected.
    #[error("exactly two plates must be selected")]
    NotTwoSelected,

    /// No unused invite code was found.
    #[error("no free invite code after {0} attempts")]
    CodeSpaceExhausted(usize),

    /// A restored room's invite code is held by another live room.
    #[error("invite code {0} already in use")]
    CodeInUse(RoomCode),

    /// A stored room record failed validation.
    #[error("invalid room data: {0}")]
    InvalidData(String),
}
