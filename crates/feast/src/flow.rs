//! Gameplay choreography: the accepted actions, their delayed follow-ups,
//! the turn clock, forfeits, game end and teardown.
//!
//! ```text
//! place_token ──1.5s──→ cover + advance ──(placement over)──→ timer
//! confirm_match ──2s──→ match?   yes → add_token phase
//!                                no  → +1 ──2s──→ next turn
//! timer at zero ────────→ +2 ──2s──→ next turn
//! add_token ────────────→ balance ≤ 0 → game end, else next turn
//! ```
//!
//! Every deferred step re-checks [`ServerState::is_live`] first.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use feast_protocol::{
    ClientState, EndReason, ErrorCode, GameEndPayload, MessageType, RoomId, ServerMessage,
    SessionId,
};
use feast_room::{MatchReveal, Room, RoomError, Winner, MATCH_FAIL_PENALTY, TIMEOUT_PENALTY};
use feast_session::{ConnectionHandle, SessionStore};
use tracing::{debug, info, warn};

use crate::server::ServerState;
use crate::FeastError;

type Shared<S> = Arc<ServerState<S>>;

/// The unfinished room `handle`'s session sits in.
pub(crate) fn seat<S: SessionStore>(
    state: &ServerState<S>,
    handle: &ConnectionHandle,
) -> Result<(Arc<Room>, usize), FeastError> {
    let (room, slot) = state
        .rooms
        .find_by_session(handle.session_id())
        .ok_or_else(|| FeastError::rejected(ErrorCode::NotInRoom, "you are not in a room"))?;
    if room.is_finished() {
        return Err(FeastError::rejected(ErrorCode::NoActiveGame, "the game is over"));
    }
    Ok((room, slot))
}

fn plate_index(index: i64) -> Result<usize, FeastError> {
    usize::try_from(index)
        .map_err(|_| FeastError::rejected(ErrorCode::InvalidAction, "no such plate"))
}

// ---------------------------------------------------------------------------
// Player actions
// ---------------------------------------------------------------------------

pub(crate) async fn place_token<S: SessionStore>(
    state: &Shared<S>,
    handle: &ConnectionHandle,
    index: i64,
) -> Result<(), FeastError> {
    let (room, slot) = seat(state, handle)?;
    let index = plate_index(index)?;
    room.place_token(slot, index)?;
    debug!(room_id = %room.id(), slot, index, "token placed");
    room.broadcast_state();
    persist(state, &room).await;

    schedule_placement_advance(state, &room, Some(index));
    Ok(())
}

/// After the reveal delay, re-covers the placed plate (if known) and
/// passes the placement turn.
pub(crate) fn schedule_placement_advance<S: SessionStore>(
    state: &Shared<S>,
    room: &Arc<Room>,
    index: Option<usize>,
) {
    let (task_state, room, room_id) = (Arc::clone(state), Arc::clone(room), room.id().clone());
    let delay = state.config.placement_reveal_delay;
    state.room_tasks.schedule(room_id, delay, async move {
        let state = task_state;
        if !state.is_live(&room) {
            return;
        }
        if let Some(index) = index {
            room.cover_plate(index);
        }
        match room.advance_placement() {
            Ok(true) => start_turn_timer(&state, &room),
            Ok(false) => {}
            Err(e) => {
                debug!(room_id = %room.id(), error = %e, "placement already resolved");
                return;
            }
        }
        room.broadcast_state();
        persist(&state, &room).await;
    });
}

/// Rejections are silent: the client simply sees no change.
pub(crate) async fn select_plate<S: SessionStore>(
    state: &Shared<S>,
    handle: &ConnectionHandle,
    index: i64,
) {
    let Ok((room, slot)) = seat(state, handle) else {
        return;
    };
    let Ok(index) = plate_index(index) else {
        return;
    };
    if room.select_plate(slot, index).is_ok() {
        room.broadcast_state();
    }
}

pub(crate) async fn confirm_match<S: SessionStore>(
    state: &Shared<S>,
    handle: &ConnectionHandle,
) -> Result<(), FeastError> {
    let (room, slot) = seat(state, handle)?;
    let reveal = room.confirm_match(slot).map_err(|e| match e {
        RoomError::NotTwoSelected => {
            FeastError::rejected(ErrorCode::InvalidAction, "select exactly two plates first")
        }
        other => other.into(),
    })?;
    let [a, b] = reveal.plates;
    let [ta, tb] = reveal.tokens;
    room.broadcast_state_with(
        format!("Plate {} has {ta}, plate {} has {tb}.", a + 1, b + 1),
        MessageType::Info,
    );
    persist(state, &room).await;

    schedule_match_verdict(state, &room, slot, reveal);
    Ok(())
}

/// After the reveal delay, opens the add-token phase on a match, or
/// applies the mismatch penalty and queues the turn pass.
pub(crate) fn schedule_match_verdict<S: SessionStore>(
    state: &Shared<S>,
    room: &Arc<Room>,
    slot: usize,
    reveal: MatchReveal,
) {
    let (task_state, room, room_id) = (Arc::clone(state), Arc::clone(room), room.id().clone());
    let delay = state.config.match_reveal_delay;
    state.room_tasks.schedule(room_id, delay, async move {
        let state = task_state;
        if !state.is_live(&room) {
            return;
        }
        if reveal.matched {
            if room.enter_add_token_phase() {
                info!(room_id = %room.id(), slot, "pair matched");
                room.broadcast_state_with(
                    "Match! Pick a plate to add a token to.",
                    MessageType::Success,
                );
                persist(&state, &room).await;
            }
            return;
        }
        let balance = room.apply_match_penalty(slot);
        debug!(room_id = %room.id(), slot, ?balance, "no match");
        room.broadcast_state_with(
            format!("No match. +{MATCH_FAIL_PENALTY} token."),
            MessageType::Fail,
        );
        // Not saved until the turn passes: a stored uncovered pair still
        // owes its verdict, penalty included.
        schedule_turn_pass(&state, &room);
    });
}

pub(crate) async fn add_token<S: SessionStore>(
    state: &Shared<S>,
    handle: &ConnectionHandle,
    index: i64,
) -> Result<(), FeastError> {
    let (room, slot) = seat(state, handle)?;
    let index = plate_index(index)?;
    let placed = room.add_token(slot, index)?;
    debug!(
        room_id = %room.id(),
        slot,
        plate = placed.plate,
        balance = placed.balance,
        "token added"
    );
    if placed.won {
        end_game(state, &room, EndReason::Tokens, Winner::Player(slot)).await;
        return Ok(());
    }
    advance_turn(state, &room).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Turns
// ---------------------------------------------------------------------------

/// Passes the matching turn, or ends the game when no pair is left.
pub(crate) async fn advance_turn<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>) {
    match room.advance_matching() {
        Ok(true) => {
            start_turn_timer(state, room);
            room.broadcast_state();
            persist(state, room).await;
        }
        Ok(false) => {
            let winner = room.winner();
            end_game(state, room, EndReason::NoMatches, winner).await;
        }
        Err(e) => debug!(room_id = %room.id(), error = %e, "turn not advanced"),
    }
}

pub(crate) fn schedule_turn_pass<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>) {
    let (task_state, room, room_id) = (Arc::clone(state), Arc::clone(room), room.id().clone());
    state.room_tasks.schedule(room_id, state.config.turn_pass_delay, async move {
        if task_state.is_live(&room) {
            advance_turn(&task_state, &room).await;
        }
    });
}

/// (Re)starts the matching clock. Each tick re-broadcasts the state so
/// clients see `timeLeft` count down.
pub(crate) fn start_turn_timer<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>) {
    let ticking = Arc::downgrade(room);
    let timed_out = Arc::downgrade(room);
    let owner = Arc::downgrade(state);
    room.start_timer(
        move |_left| {
            if let Some(room) = ticking.upgrade() {
                room.broadcast_state();
            }
        },
        move || {
            let (Some(state), Some(room)) = (owner.upgrade(), timed_out.upgrade()) else {
                return;
            };
            tokio::spawn(on_turn_timeout(state, room));
        },
    );
}

// Boxed: the timeout schedules a turn pass, which restarts the timer.
fn on_turn_timeout<S: SessionStore>(
    state: Shared<S>,
    room: Arc<Room>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> {
    Box::pin(async move {
        if !state.is_live(&room) {
            return;
        }
        let Some(slot) = room.apply_timeout_penalty() else {
            return;
        };
        info!(room_id = %room.id(), slot, "turn timed out");
        room.broadcast_state_with(
            format!("Time's up! +{TIMEOUT_PENALTY} tokens."),
            MessageType::Info,
        );
        persist(&state, &room).await;
        schedule_turn_pass(&state, &room);
    })
}

// ---------------------------------------------------------------------------
// Forfeits
// ---------------------------------------------------------------------------

/// Ends the game in the opponent's favour unless `slot` is back within
/// the grace period.
pub(crate) fn schedule_forfeit<S: SessionStore>(
    state: &Shared<S>,
    room: &Arc<Room>,
    slot: usize,
) {
    let key = (room.id().clone(), slot);
    state.forfeits.cancel(&key);
    let grace = state.config.reconnect_grace;
    let (task_state, task_room) = (Arc::clone(state), Arc::clone(room));
    state.forfeits.schedule(key, grace, async move {
        forfeit(&task_state, &task_room, slot).await;
    });
    info!(room_id = %room.id(), slot, grace_secs = grace.as_secs(), "forfeit scheduled");
}

async fn forfeit<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>, slot: usize) {
    if !state.is_live(room) {
        return;
    }
    let Some(player) = room.player(slot) else {
        return;
    };
    if player.is_connected() {
        debug!(room_id = %room.id(), slot, "player returned, forfeit skipped");
        return;
    }
    info!(room_id = %room.id(), slot, "player forfeited");
    end_game(state, room, EndReason::Forfeit, Winner::Player(1 - slot)).await;
}

/// Cancels a pending forfeit for a seat. Returns whether one was pending.
pub(crate) fn cancel_forfeit<S: SessionStore>(
    state: &ServerState<S>,
    room_id: &RoomId,
    slot: usize,
) -> bool {
    state.forfeits.cancel(&(room_id.clone(), slot)) > 0
}

// ---------------------------------------------------------------------------
// Game end & teardown
// ---------------------------------------------------------------------------

/// Announces the result and tears the room down. Only the first call
/// for a room does anything.
pub(crate) async fn end_game<S: SessionStore>(
    state: &Shared<S>,
    room: &Arc<Room>,
    reason: EndReason,
    winner: Winner,
) {
    if !room.finish() {
        return;
    }
    let winner_name = match winner {
        Winner::Player(slot) => room
            .player(slot)
            .map(|p| p.nickname().to_owned())
            .unwrap_or_default(),
        Winner::Draw => String::new(),
    };
    let final_tokens = room.final_tokens();
    info!(room_id = %room.id(), ?reason, ?winner, ?final_tokens, "game over");

    room.broadcast_state();
    room.broadcast(&ServerMessage::GameEnd(GameEndPayload {
        winner: winner.display_index(),
        winner_name,
        reason,
        final_tokens,
    }));
    for player in room.players().iter().flatten() {
        if !player.is_connected() {
            continue;
        }
        if let Some(conn) = state.registry.lookup(player.session_id()) {
            conn.set_client_state(ClientState::Lobby);
        }
    }
    teardown(state, room.id()).await;
}

/// Forgets a room everywhere: pending tasks, the index, and the store.
pub(crate) async fn teardown<S: SessionStore>(state: &ServerState<S>, room_id: &RoomId) {
    state.room_tasks.cancel(room_id);
    for slot in 0..2 {
        state.forfeits.cancel(&(room_id.clone(), slot));
    }
    let Some(room) = state.rooms.remove(room_id) else {
        return;
    };
    room.stop_timer();

    for player in room.players().iter().flatten() {
        forget_seat(state, player.session_id(), room_id).await;
    }
    if let Err(e) = state.store.delete_room(room_id).await {
        warn!(room_id = %room_id, error = %e, "failed to delete stored room");
    }
    info!(room_id = %room_id, "room torn down");
}

// ---------------------------------------------------------------------------
// Store syncing
// ---------------------------------------------------------------------------

pub(crate) async fn persist<S: SessionStore>(state: &ServerState<S>, room: &Room) {
    if let Err(e) = state.store.save_room(&room.to_data()).await {
        warn!(room_id = %room.id(), error = %e, "failed to save room");
    }
}

pub(crate) async fn remember_seat<S: SessionStore>(
    state: &ServerState<S>,
    session_id: &SessionId,
    room_id: &RoomId,
    slot: usize,
) {
    if let Err(e) = state.store.save_session(session_id, room_id, slot).await {
        warn!(%session_id, room_id = %room_id, error = %e, "failed to save session");
    }
}

/// Deletes the session's seat record if it still points at `room_id`.
pub(crate) async fn forget_seat<S: SessionStore>(
    state: &ServerState<S>,
    session_id: &SessionId,
    room_id: &RoomId,
) {
    match state.store.get_session(session_id).await {
        Ok(Some(record)) if &record.room_id == room_id => {
            if let Err(e) = state.store.delete_session(session_id).await {
                warn!(%session_id, error = %e, "failed to delete session");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(%session_id, error = %e, "failed to read session"),
    }
}
