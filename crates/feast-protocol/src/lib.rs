//! Wire protocol for the Memory Feast server.
//!
//! This crate defines the "language" that browser clients and the server
//! speak:
//!
//! - **Identity types** ([`SessionId`], [`RoomId`], [`RoomCode`],
//!   [`PlayerId`]) and the game [`Phase`].
//! - **Messages** ([`Envelope`] → [`ClientMessage`] inbound,
//!   [`ServerMessage`] outbound) and the [`ClientState`] rule that says
//!   which messages a connection may send right now.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]).
//! - **Errors** ([`ProtocolError`]), each mapped to a wire [`ErrorCode`].
//!
//! ```text
//! Transport (text frames) → Protocol (Envelope/ClientMessage) → Server
//! ```

mod codec;
mod error;
mod messages;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use messages::{
    ClientMessage, ClientState, CreateRoomPayload, EndReason, Envelope,
    ErrorCode, ErrorPayload, GameEndPayload, GameStatePayload, IndexPayload,
    JoinQueuePayload, JoinRoomPayload, MatchedPayload, MessageKind,
    MessageType, PlateView, PlayerLeftPayload, PlayerView,
    QueueJoinedPayload, QueueTimeoutPayload, ReconnectPayload,
    ReconnectedPayload, RoomCreatedPayload, ServerMessage,
};
pub use types::{
    Phase, PlayerId, RoomCode, RoomId, SessionId, MAX_SESSION_ID_LEN,
    ROOM_CODE_ALPHABET, ROOM_CODE_LEN,
};
