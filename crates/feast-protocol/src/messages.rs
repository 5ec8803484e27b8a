//! Messages exchanged between the browser client and the server.
//!
//! Every frame is a JSON object of the form
//!
//! ```text
//! { "type": "select_plate", "payload": { "index": 3 } }
//! ```
//!
//! Inbound frames are first decoded as a loose [`Envelope`] so that an
//! unknown `type` and a malformed `payload` can be told apart and
//! answered with different error codes. Outbound frames are produced by
//! serializing a [`ServerMessage`], which serde tags adjacently
//! (`tag = "type", content = "payload"`) to get the same shape.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Phase, ProtocolError, RoomCode, RoomId};

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The raw inbound frame, before the payload is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type, e.g. `"join_queue"`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Type-specific payload. Absent for `confirm_match` and `leave_room`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// Every message type a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinQueue,
    CreateRoom,
    JoinRoom,
    PlaceToken,
    SelectPlate,
    ConfirmMatch,
    AddToken,
    Reconnect,
    LeaveRoom,
}

impl MessageKind {
    /// Looks up a wire name.
    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "join_queue" => Self::JoinQueue,
            "create_room" => Self::CreateRoom,
            "join_room" => Self::JoinRoom,
            "place_token" => Self::PlaceToken,
            "select_plate" => Self::SelectPlate,
            "confirm_match" => Self::ConfirmMatch,
            "add_token" => Self::AddToken,
            "reconnect" => Self::Reconnect,
            "leave_room" => Self::LeaveRoom,
            _ => return None,
        })
    }

    /// Wire name of the message type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JoinQueue => "join_queue",
            Self::CreateRoom => "create_room",
            Self::JoinRoom => "join_room",
            Self::PlaceToken => "place_token",
            Self::SelectPlate => "select_plate",
            Self::ConfirmMatch => "confirm_match",
            Self::AddToken => "add_token",
            Self::Reconnect => "reconnect",
            Self::LeaveRoom => "leave_room",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `join_queue` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinQueuePayload {
    pub nickname: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub plate_count: Option<i64>,
}

/// `create_room` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomPayload {
    pub nickname: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub plate_count: Option<i64>,
}

/// `join_room` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomPayload {
    pub nickname: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub room_code: String,
}

/// Payload of the plate actions (`place_token`, `select_plate`,
/// `add_token`). Signed so that a negative index is a rejected action
/// rather than a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPayload {
    pub index: i64,
}

/// `reconnect` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPayload {
    pub session_id: String,
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    JoinQueue(JoinQueuePayload),
    CreateRoom(CreateRoomPayload),
    JoinRoom(JoinRoomPayload),
    PlaceToken(IndexPayload),
    SelectPlate(IndexPayload),
    ConfirmMatch,
    AddToken(IndexPayload),
    Reconnect(ReconnectPayload),
    LeaveRoom,
}

impl ClientMessage {
    /// The message's type tag.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::JoinQueue(_) => MessageKind::JoinQueue,
            Self::CreateRoom(_) => MessageKind::CreateRoom,
            Self::JoinRoom(_) => MessageKind::JoinRoom,
            Self::PlaceToken(_) => MessageKind::PlaceToken,
            Self::SelectPlate(_) => MessageKind::SelectPlate,
            Self::ConfirmMatch => MessageKind::ConfirmMatch,
            Self::AddToken(_) => MessageKind::AddToken,
            Self::Reconnect(_) => MessageKind::Reconnect,
            Self::LeaveRoom => MessageKind::LeaveRoom,
        }
    }
}

fn payload<T: DeserializeOwned>(
    kind: MessageKind,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

impl TryFrom<Envelope> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let kind = MessageKind::parse(&envelope.kind)
            .ok_or(ProtocolError::UnknownType(envelope.kind))?;
        let value = envelope.payload.unwrap_or(serde_json::Value::Null);

        Ok(match kind {
            MessageKind::JoinQueue => Self::JoinQueue(payload(kind, value)?),
            MessageKind::CreateRoom => Self::CreateRoom(payload(kind, value)?),
            MessageKind::JoinRoom => Self::JoinRoom(payload(kind, value)?),
            MessageKind::PlaceToken => Self::PlaceToken(payload(kind, value)?),
            MessageKind::SelectPlate => Self::SelectPlate(payload(kind, value)?),
            MessageKind::ConfirmMatch => Self::ConfirmMatch,
            MessageKind::AddToken => Self::AddToken(payload(kind, value)?),
            MessageKind::Reconnect => Self::Reconnect(payload(kind, value)?),
            MessageKind::LeaveRoom => Self::LeaveRoom,
        })
    }
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

/// Where a connection is in its lifecycle. Each state admits a fixed
/// set of message types; anything else is answered with `invalid_state`.
///
/// ```text
/// Lobby ──queue/create──→ Waiting ──matched/joined──→ InGame
///   ↑                        │                          │
///   └──────── leave / queue timeout / game end ─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Lobby,
    Waiting,
    InGame,
}

impl ClientState {
    /// Whether a message of `kind` is accepted in this state.
    pub fn allows(self, kind: MessageKind) -> bool {
        use MessageKind::*;
        match self {
            Self::Lobby => matches!(kind, JoinQueue | CreateRoom | JoinRoom | Reconnect),
            Self::Waiting => matches!(kind, LeaveRoom),
            Self::InGame => matches!(
                kind,
                PlaceToken | SelectPlate | ConfirmMatch | AddToken | LeaveRoom
            ),
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Lobby => "lobby",
            Self::Waiting => "waiting",
            Self::InGame => "in_game",
        })
    }
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// Stable error codes carried by `error` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidMessage,
    InvalidState,
    InvalidNickname,
    InvalidRoomCode,
    RoomNotFound,
    RoomFull,
    JoinFailed,
    NotInRoom,
    InvalidAction,
    NoActiveGame,
    PlayerNotFound,
    GracePeriodExpired,
    Internal,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// `queue_joined` payload. Positions are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJoinedPayload {
    pub position: usize,
}

/// `queue_timeout` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTimeoutPayload {
    pub timeout_seconds: u64,
}

/// Payload of `matched` and `room_joined`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedPayload {
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_code: Option<RoomCode>,
    pub player_index: usize,
    pub opponent_nickname: String,
}

/// `room_created` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreatedPayload {
    pub room_id: RoomId,
    pub room_code: RoomCode,
}

/// Tone of the status line shown with a state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Success,
    Fail,
    Info,
}

/// A player as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub nickname: String,
    pub tokens: i32,
    pub is_connected: bool,
}

/// A plate as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateView {
    pub tokens: u32,
    pub covered: bool,
    pub has_tokens: bool,
}

/// `game_state` payload: one viewer's snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStatePayload {
    pub phase: Phase,
    pub current_turn: usize,
    pub placement_round: u32,
    pub max_round: u32,
    pub time_left: u32,
    pub players: Vec<PlayerView>,
    pub plates: Vec<PlateView>,
    pub selected_plates: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_selected_plates: Option<Vec<usize>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched_plates: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_plate: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
}

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// A player ran out of tokens.
    Tokens,
    /// No two plates share a token count any more.
    NoMatches,
    /// A player left and did not come back within the grace period.
    Forfeit,
}

/// `game_end` payload. `winner` is 1-indexed; 0 means a draw.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameEndPayload {
    pub winner: usize,
    pub winner_name: String,
    pub reason: EndReason,
    pub final_tokens: [i32; 2],
}

/// `player_left` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerLeftPayload {
    pub player_index: usize,
    pub grace_period_seconds: u64,
}

/// `reconnected` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectedPayload {
    pub player_index: usize,
}

/// Every message the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Error(ErrorPayload),
    QueueJoined(QueueJoinedPayload),
    QueueTimeout(QueueTimeoutPayload),
    Matched(MatchedPayload),
    RoomCreated(RoomCreatedPayload),
    RoomJoined(MatchedPayload),
    GameState(GameStatePayload),
    GameEnd(GameEndPayload),
    PlayerLeft(PlayerLeftPayload),
    Reconnected(ReconnectedPayload),
}

impl ServerMessage {
    /// Shorthand for an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }

    /// Wire name of the message type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Error(_) => "error",
            Self::QueueJoined(_) => "queue_joined",
            Self::QueueTimeout(_) => "queue_timeout",
            Self::Matched(_) => "matched",
            Self::RoomCreated(_) => "room_created",
            Self::RoomJoined(_) => "room_joined",
            Self::GameState(_) => "game_state",
            Self::GameEnd(_) => "game_end",
            Self::PlayerLeft(_) => "player_left",
            Self::Reconnected(_) => "reconnected",
        }
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn decode(value: serde_json::Value) -> Result<ClientMessage, ProtocolError> {
        let envelope: Envelope = serde_json::from_value(value).unwrap();
        ClientMessage::try_from(envelope)
    }

    // =====================================================================
    // Inbound
    // =====================================================================

    #[test]
    fn test_decode_join_queue_with_optional_fields() {
        let msg = decode(json!({
            "type": "join_queue",
            "payload": { "nickname": "mina", "sessionId": "s-1" }
        }))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::JoinQueue(JoinQueuePayload {
                nickname: "mina".into(),
                session_id: Some("s-1".into()),
                plate_count: None,
            })
        );
    }

    #[test]
    fn test_decode_unit_messages_without_payload() {
        assert_eq!(
            decode(json!({ "type": "confirm_match" })).unwrap(),
            ClientMessage::ConfirmMatch
        );
        assert_eq!(
            decode(json!({ "type": "leave_room", "payload": {} })).unwrap(),
            ClientMessage::LeaveRoom
        );
    }

    #[test]
    fn test_decode_unknown_type_is_distinct_error() {
        let err = decode(json!({ "type": "fly", "payload": {} })).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(ref t) if t == "fly"));
        assert_eq!(err.error_code(), ErrorCode::InvalidMessage);
    }

    #[test]
    fn test_decode_missing_payload_is_invalid_payload() {
        let err = decode(json!({ "type": "place_token" })).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidPayload { kind: "place_token", .. }
        ));
        assert_eq!(err.error_code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_decode_negative_index_is_accepted_by_decoder() {
        let msg = decode(json!({ "type": "add_token", "payload": { "index": -1 } }))
            .unwrap();
        assert_eq!(msg, ClientMessage::AddToken(IndexPayload { index: -1 }));
        assert_eq!(msg.kind(), MessageKind::AddToken);
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    #[test]
    fn test_client_state_lobby_allows_only_entry_messages() {
        let lobby = ClientState::Lobby;
        assert!(lobby.allows(MessageKind::JoinQueue));
        assert!(lobby.allows(MessageKind::CreateRoom));
        assert!(lobby.allows(MessageKind::JoinRoom));
        assert!(lobby.allows(MessageKind::Reconnect));
        assert!(!lobby.allows(MessageKind::PlaceToken));
        assert!(!lobby.allows(MessageKind::LeaveRoom));
    }

    #[test]
    fn test_client_state_waiting_allows_only_leave() {
        let waiting = ClientState::Waiting;
        assert!(waiting.allows(MessageKind::LeaveRoom));
        assert!(!waiting.allows(MessageKind::JoinQueue));
        assert!(!waiting.allows(MessageKind::SelectPlate));
    }

    #[test]
    fn test_client_state_in_game_allows_gameplay_and_leave() {
        let in_game = ClientState::InGame;
        for kind in [
            MessageKind::PlaceToken,
            MessageKind::SelectPlate,
            MessageKind::ConfirmMatch,
            MessageKind::AddToken,
            MessageKind::LeaveRoom,
        ] {
            assert!(in_game.allows(kind), "{kind} should be allowed");
        }
        assert!(!in_game.allows(MessageKind::Reconnect));
        assert!(!in_game.allows(MessageKind::CreateRoom));
    }

    // =====================================================================
    // Outbound JSON shapes
    // =====================================================================

    #[test]
    fn test_error_message_shape() {
        let msg = ServerMessage::error(ErrorCode::InvalidState, "not now");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "error",
                "payload": { "code": "invalid_state", "message": "not now" }
            })
        );
    }

    #[test]
    fn test_matched_omits_missing_room_code() {
        let msg = ServerMessage::Matched(MatchedPayload {
            room_id: RoomId::new("r1"),
            room_code: None,
            player_index: 1,
            opponent_nickname: "kai".into(),
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "matched",
                "payload": { "roomId": "r1", "playerIndex": 1, "opponentNickname": "kai" }
            })
        );
    }

    #[test]
    fn test_game_state_optional_fields_are_skipped() {
        let payload = GameStatePayload {
            phase: Phase::Placement,
            current_turn: 0,
            placement_round: 1,
            max_round: 1,
            time_left: 0,
            players: vec![PlayerView::default(), PlayerView::default()],
            plates: vec![PlateView { tokens: 1, covered: true, has_tokens: true }],
            selected_plates: vec![],
            opponent_selected_plates: None,
            matched_plates: vec![],
            last_action_plate: None,
            message: None,
            message_type: None,
        };
        let value = serde_json::to_value(ServerMessage::GameState(payload)).unwrap();
        let body = &value["payload"];
        assert_eq!(body["phase"], "placement");
        assert_eq!(body["plates"][0], json!({ "tokens": 1, "covered": true, "hasTokens": true }));
        assert_eq!(body["selectedPlates"], json!([]));
        assert!(body.get("matchedPlates").is_none());
        assert!(body.get("opponentSelectedPlates").is_none());
        assert!(body.get("messageType").is_none());
        assert_eq!(body["players"][0]["isConnected"], false);
    }

    #[test]
    fn test_game_end_shape() {
        let msg = ServerMessage::GameEnd(GameEndPayload {
            winner: 0,
            winner_name: String::new(),
            reason: EndReason::NoMatches,
            final_tokens: [3, 3],
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["payload"]["reason"], "no_matches");
        assert_eq!(value["payload"]["finalTokens"], json!([3, 3]));
        assert_eq!(msg.kind(), "game_end");
    }

    #[test]
    fn test_player_left_uses_grace_period_seconds() {
        let msg = ServerMessage::PlayerLeft(PlayerLeftPayload {
            player_index: 0,
            grace_period_seconds: 30,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value["payload"],
            json!({ "playerIndex": 0, "gracePeriodSeconds": 30 })
        );
    }
}
