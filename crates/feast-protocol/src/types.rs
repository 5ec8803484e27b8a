//! Identity and phase types shared by every layer.
//!
//! These are the values that appear both on the wire and inside the
//! server: session ids, room ids, invite codes and the game phase.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Random identifiers
// ---------------------------------------------------------------------------

/// Characters an invite code is drawn from. `I`, `O`, `0` and `1` are
/// left out because they are easy to confuse when read aloud.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Length of an invite code.
pub const ROOM_CODE_LEN: usize = 6;

/// Longest session id accepted from a client.
pub const MAX_SESSION_ID_LEN: usize = 64;

/// 128 random bits rendered as 32 lowercase hex characters.
fn random_hex() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// The durable correlation key for a player.
///
/// A browser keeps its session id across page reloads and hands it back
/// on reconnect, so this id, not the socket, identifies "the same player".
///
/// `#[serde(transparent)]` makes it serialize as a bare JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps an already-trusted value (store records, tests).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generates a fresh random session id.
    pub fn generate() -> Self {
        Self(random_hex())
    }

    /// Validates a client-supplied session id.
    ///
    /// Accepts 1 to [`MAX_SESSION_ID_LEN`] characters of `[A-Za-z0-9_-]`.
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_SESSION_ID_LEN
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        valid.then(|| Self(raw.to_owned()))
    }

    /// Borrows the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// PlayerId
// ---------------------------------------------------------------------------

/// Identifier of a player inside a room.
///
/// Derived from the session id the player first joined with, so a
/// restored room can be matched against a reconnecting client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// The player id belonging to a session.
    pub fn for_session(session: &SessionId) -> Self {
        Self(session.as_str().to_owned())
    }

    /// Borrows the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RoomId
// ---------------------------------------------------------------------------

/// A unique identifier for a room, 32 hex characters of randomness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wraps an existing id (store records, tests).
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generates a fresh random room id.
    pub fn generate() -> Self {
        Self(random_hex())
    }

    /// Borrows the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// RoomCode
// ---------------------------------------------------------------------------

/// A short, human-shareable invite code such as `K7WQ2M`.
///
/// Codes are random and can collide; the room index is responsible for
/// rejecting a code that is already in use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Draws a random code from [`ROOM_CODE_ALPHABET`].
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..ROOM_CODE_LEN)
            .map(|_| {
                let i = rng.random_range(0..ROOM_CODE_ALPHABET.len());
                char::from(ROOM_CODE_ALPHABET[i])
            })
            .collect();
        Self(code)
    }

    /// Validates user input. Lowercase letters are accepted and upcased.
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        let valid = code.len() == ROOM_CODE_LEN
            && code.bytes().all(|b| ROOM_CODE_ALPHABET.contains(&b));
        valid.then_some(Self(code))
    }

    /// Borrows the raw string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// The match's current stage.
///
/// ```text
/// Waiting → Placement → Matching ⇄ AddToken
///                           └──────────┴──→ Finished
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Room exists but the game has not started.
    #[default]
    Waiting,
    /// Players take turns placing tokens on empty plates.
    Placement,
    /// The current player picks two plates and tests them for a match.
    Matching,
    /// After a match, the current player adds a token to one of the pair.
    AddToken,
    /// Terminal.
    Finished,
}

impl Phase {
    /// Wire name of the phase.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Placement => "placement",
            Self::Matching => "matching",
            Self::AddToken => "add_token",
            Self::Finished => "finished",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =========================================================================
// Tests
// =========================================================================
