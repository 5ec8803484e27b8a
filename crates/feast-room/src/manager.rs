//! Room manager: creates, indexes, and looks up live rooms.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use feast_protocol::{RoomCode, RoomId, SessionId};
use feast_session::ConnectionRegistry;
use tracing::{info, warn};

use crate::{Room, RoomConfig, RoomError, RoomEvents};

/// How many invite codes are tried before giving up.
pub const MAX_CODE_ATTEMPTS: usize = 32;

#[derive(Default)]
struct Index {
    rooms: HashMap<RoomId, Arc<Room>>,
    codes: HashMap<RoomCode, RoomId>,
}

/// Index of every live room, by id and by invite code.
///
/// Invite codes are unique among live rooms: a colliding code is
/// regenerated at creation time.
pub struct RoomManager {
    config: RoomConfig,
    registry: Arc<ConnectionRegistry>,
    events: Option<RoomEvents>,
    index: RwLock<Index>,
}

impl RoomManager {
    /// Creates an empty manager. Rooms it creates report to `events`.
    pub fn new(
        config: RoomConfig,
        registry: Arc<ConnectionRegistry>,
        events: Option<RoomEvents>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            index: RwLock::new(Index::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Index> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Index> {
        self.index.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn events(&self) -> Option<&RoomEvents> {
        self.events.as_ref()
    }

    /// Creates and indexes an empty room with a fresh id and invite code.
    pub fn create_room(&self, plate_count: usize) -> Result<Arc<Room>, RoomError> {
        self.create_with(plate_count, RoomCode::generate)
    }

    fn create_with(
        &self,
        plate_count: usize,
        mut next_code: impl FnMut() -> RoomCode,
    ) -> Result<Arc<Room>, RoomError> {
        let mut index = self.write();
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = next_code();
            if index.codes.contains_key(&code) {
                continue;
            }
            let room = Arc::new(Room::new(
                RoomId::generate(),
                code.clone(),
                plate_count,
                self.config.clone(),
                Arc::clone(&self.registry),
                self.events.clone(),
            ));
            index.codes.insert(code, room.id().clone());
            index.rooms.insert(room.id().clone(), Arc::clone(&room));
            info!(
                room_id = %room.id(),
                code = %room.code(),
                plates = room.plate_count(),
                "room created"
            );
            return Ok(room);
        }
        warn!(attempts = MAX_CODE_ATTEMPTS, "invite code space exhausted");
        Err(RoomError::CodeSpaceExhausted(MAX_CODE_ATTEMPTS))
    }

    /// Indexes an existing room, such as one restored from the store.
    ///
    /// If a room with the same id is already indexed, that room is kept
    /// and returned instead.
    pub fn insert(&self, room: Arc<Room>) -> Result<Arc<Room>, RoomError> {
        let mut index = self.write();
        if let Some(existing) = index.rooms.get(room.id()) {
            return Ok(Arc::clone(existing));
        }
        if index.codes.contains_key(room.code()) {
            return Err(RoomError::CodeInUse(room.code().clone()));
        }
        index.codes.insert(room.code().clone(), room.id().clone());
        index.rooms.insert(room.id().clone(), Arc::clone(&room));
        info!(room_id = %room.id(), "room indexed");
        Ok(room)
    }

    pub fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.read().rooms.get(id).cloned()
    }

    /// Looks a room up by invite code. `RoomCode` is already upper-cased.
    pub fn get_by_code(&self, code: &RoomCode) -> Option<Arc<Room>> {
        let index = self.read();
        index
            .codes
            .get(code)
            .and_then(|id| index.rooms.get(id))
            .cloned()
    }

    /// Finds the live room seating `session_id`, preferring one that has
    /// not finished.
    pub fn find_by_session(&self, session_id: &SessionId) -> Option<(Arc<Room>, usize)> {
        let rooms: Vec<Arc<Room>> = self.read().rooms.values().cloned().collect();
        let mut seated = rooms.into_iter().filter_map(|room| {
            let (slot, _) = room.player_by_session(session_id)?;
            Some((room, slot))
        });
        let first = seated.next()?;
        if !first.0.is_finished() {
            return Some(first);
        }
        seated.find(|(room, _)| !room.is_finished()).or(Some(first))
    }

    /// Drops a room from the index. Its code is released only if it
    /// still points at this room.
    pub fn remove(&self, id: &RoomId) -> Option<Arc<Room>> {
        let mut index = self.write();
        let room = index.rooms.remove(id)?;
        if index.codes.get(room.code()) == Some(id) {
            index.codes.remove(room.code());
        }
        info!(room_id = %id, "room removed");
        Some(room)
    }

    /// Indexed and not finished.
    pub fn is_live(&self, id: &RoomId) -> bool {
        self.get(id).is_some_and(|room| !room.is_finished())
    }

    pub fn room_count(&self) -> usize {
        self.read().rooms.len()
    }
}
