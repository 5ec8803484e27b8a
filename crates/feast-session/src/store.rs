//! Session store: crash-recoverable lookups outside the live rooms.
//!
//! While a room is in memory the room itself is the source of truth.
//! The store only answers two questions for a client that comes back:
//! "which room and seat did session S have?" and "what did that room
//! look like?". Records expire on their own so an abandoned session
//! does not linger forever.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use feast_protocol::{Phase, PlayerId, RoomCode, RoomId, SessionId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::StoreError;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Serializable snapshot of one plate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlateData {
    pub tokens: u32,
    pub covered: bool,
    pub has_tokens: bool,
}

/// Serializable snapshot of a player seat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerData {
    pub id: PlayerId,
    pub nickname: String,
    pub session_id: SessionId,
    pub tokens: i32,
}

/// Serializable snapshot of the game state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateData {
    pub phase: Phase,
    pub current_turn: usize,
    pub placement_round: u32,
    pub max_round: u32,
    pub time_left: u32,
    pub plates: Vec<PlateData>,
    pub selected_plates: Vec<usize>,
    pub matched_plates: Vec<usize>,
}

/// Serializable snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
    pub id: RoomId,
    pub code: RoomCode,
    pub plate_count: usize,
    pub players: [Option<PlayerData>; 2],
    pub state: StateData,
    /// Unix seconds.
    pub created_at: u64,
}

/// Where a session was last seated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub room_id: RoomId,
    pub player_index: usize,
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Persistence contract for room snapshots and session seats.
///
/// Backends must be cheap to share across tasks; every method is called
/// from connection handlers and deferred tasks concurrently.
pub trait SessionStore: Send + Sync + 'static {
    fn save_room(&self, room: &RoomData)
    -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_room(&self, id: &RoomId)
    -> impl Future<Output = Result<Option<RoomData>, StoreError>> + Send;

    fn get_room_by_code(
        &self,
        code: &RoomCode,
    ) -> impl Future<Output = Result<Option<RoomData>, StoreError>> + Send;

    fn delete_room(&self, id: &RoomId) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn save_session(
        &self,
        session_id: &SessionId,
        room_id: &RoomId,
        player_index: usize,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_session(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<Option<SessionRecord>, StoreError>> + Send;

    fn delete_session(
        &self,
        session_id: &SessionId,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Expiry settings for [`MemoryStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a room snapshot survives without being re-saved.
    pub room_ttl: Duration,
    /// How long a session seat survives without being re-saved.
    pub session_ttl: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            room_ttl: Duration::from_secs(24 * 60 * 60),
            session_ttl: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Clone> Expiring<T> {
    fn live(&self, now: Instant) -> Option<T> {
        (now < self.expires_at).then(|| self.value.clone())
    }
}

#[derive(Debug, Default)]
struct Tables {
    rooms: HashMap<RoomId, Expiring<RoomData>>,
    codes: HashMap<RoomCode, RoomId>,
    sessions: HashMap<SessionId, Expiring<SessionRecord>>,
}

/// In-process [`SessionStore`] with per-record expiry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    config: StoreConfig,
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            tables: Mutex::new(Tables::default()),
        }
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops every expired record. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tables = self.tables();
        let before = tables.rooms.len() + tables.sessions.len();

        tables.rooms.retain(|_, r| now < r.expires_at);
        let Tables { rooms, codes, .. } = &mut *tables;
        codes.retain(|_, id| rooms.contains_key(id));
        tables.sessions.retain(|_, s| now < s.expires_at);

        let removed = before - (tables.rooms.len() + tables.sessions.len());
        if removed > 0 {
            tracing::debug!(removed, "purged expired store records");
        }
        removed
    }
}

impl SessionStore for MemoryStore {
    async fn save_room(&self, room: &RoomData) -> Result<(), StoreError> {
        let expires_at = Instant::now() + self.config.room_ttl;
        let mut tables = self.tables();
        tables.codes.insert(room.code.clone(), room.id.clone());
        tables.rooms.insert(
            room.id.clone(),
            Expiring {
                value: room.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_room(&self, id: &RoomId) -> Result<Option<RoomData>, StoreError> {
        let now = Instant::now();
        Ok(self.tables().rooms.get(id).and_then(|r| r.live(now)))
    }

    async fn get_room_by_code(&self, code: &RoomCode) -> Result<Option<RoomData>, StoreError> {
        let now = Instant::now();
        let tables = self.tables();
        Ok(tables
            .codes
            .get(code)
            .and_then(|id| tables.rooms.get(id))
            .and_then(|r| r.live(now)))
    }

    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        let mut tables = self.tables();
        if let Some(room) = tables.rooms.remove(id) {
            // Only drop the code entry if it still points at this room.
            if tables.codes.get(&room.value.code) == Some(id) {
                tables.codes.remove(&room.value.code);
            }
        }
        Ok(())
    }

    async fn save_session(
        &self,
        session_id: &SessionId,
        room_id: &RoomId,
        player_index: usize,
    ) -> Result<(), StoreError> {
        let expires_at = Instant::now() + self.config.session_ttl;
        self.tables().sessions.insert(
            session_id.clone(),
            Expiring {
                value: SessionRecord {
                    room_id: room_id.clone(),
                    player_index,
                },
                expires_at,
            },
        );
        Ok(())
    }

    async fn get_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = Instant::now();
        Ok(self.tables().sessions.get(session_id).and_then(|s| s.live(now)))
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), StoreError> {
        self.tables().sessions.remove(session_id);
        Ok(())
    }
}
