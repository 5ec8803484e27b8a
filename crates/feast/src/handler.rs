//! Per-connection handler: session binding, lifecycle checks, and
//! message routing.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Bind a session id (the `sessionId` query parameter or a fresh one)
//!      and register with the connection registry
//!   2. Spawn the writer: drains the outbound queue, pings, drops idle peers
//!   3. Loop: decode → check the client state → route
//!   4. Disconnect teardown

use std::sync::Arc;
use std::time::Duration;

use feast_protocol::{
    ClientMessage, ClientState, Codec, CreateRoomPayload, EndReason, Envelope, ErrorCode,
    JoinQueuePayload, JoinRoomPayload, MatchedPayload, Phase, PlayerLeftPayload,
    QueueJoinedPayload, ReconnectPayload, ReconnectedPayload, RoomCode, RoomCreatedPayload,
    ServerMessage, SessionId,
};
use feast_room::{
    clamp_plate_count, JoinOutcome, PendingStep, Room, RoomError, Winner, DEFAULT_PLATE_COUNT,
    MIN_PLATE_COUNT,
};
use feast_session::{ConnectionHandle, Outbound, OutboundReceiver, Player, SessionStore};
use feast_transport::{Connection, WebSocketConnection};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::flow;
use crate::server::ServerState;
use crate::FeastError;

/// Longest accepted nickname, in characters, after trimming.
pub(crate) const MAX_NICKNAME_CHARS: usize = 20;

type Shared<S> = Arc<ServerState<S>>;

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<S: SessionStore>(
    conn: WebSocketConnection,
    state: Shared<S>,
) -> Result<(), FeastError> {
    let session_id = conn
        .query_param("sessionId")
        .and_then(SessionId::parse)
        .unwrap_or_else(SessionId::generate);
    let peer = conn.peer_addr();
    let conn = Arc::new(conn);

    let (tx, rx) = mpsc::unbounded_channel();
    let mut handle = state.registry.register(session_id, tx);
    info!(conn_id = %handle.id(), session_id = %handle.session_id(), %peer, "client connected");

    let mut writer = tokio::spawn(write_loop(
        Arc::clone(&conn),
        rx,
        state.config.ping_interval,
        state.config.idle_timeout,
    ));

    let result = loop {
        tokio::select! {
            frame = conn.recv() => match frame {
                Ok(Some(data)) => dispatch(&state, &mut handle, &data).await,
                Ok(None) => {
                    debug!(conn_id = %handle.id(), "connection closed cleanly");
                    break Ok(());
                }
                Err(e) => break Err(FeastError::from(e)),
            },
            _ = &mut writer => {
                debug!(conn_id = %handle.id(), "writer stopped");
                break Ok(());
            }
        }
    };

    disconnect(&state, &handle).await;
    writer.abort();
    result
}

/// Drains the outbound queue onto the socket and keeps it alive.
///
/// Stops on [`Outbound::Close`], on a failed write, or when the peer has
/// been silent for longer than `idle_timeout`.
async fn write_loop(
    conn: Arc<WebSocketConnection>,
    mut outbound: OutboundReceiver,
    ping_every: Duration,
    idle_timeout: Duration,
) {
    let mut heartbeat = time::interval_at(Instant::now() + ping_every, ping_every);
    loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(Outbound::Frame(bytes)) => {
                    if let Err(e) = conn.send(&bytes).await {
                        debug!(conn_id = %conn.id(), error = %e, "write failed");
                        break;
                    }
                }
                Some(Outbound::Close) | None => break,
            },
            _ = heartbeat.tick() => {
                if conn.idle_for() > idle_timeout {
                    info!(conn_id = %conn.id(), "closing idle connection");
                    break;
                }
                if let Err(e) = conn.ping().await {
                    debug!(conn_id = %conn.id(), error = %e, "ping failed");
                    break;
                }
            }
        }
    }
    if let Err(e) = conn.close().await {
        debug!(conn_id = %conn.id(), error = %e, "close failed");
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

async fn dispatch<S: SessionStore>(state: &Shared<S>, handle: &mut ConnectionHandle, data: &[u8]) {
    let result = match decode(state, data) {
        Ok(msg) => route(state, handle, msg).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        report(handle, &e);
    }
}

fn decode<S: SessionStore>(
    state: &ServerState<S>,
    data: &[u8],
) -> Result<ClientMessage, FeastError> {
    let envelope: Envelope = state.codec.decode(data)?;
    Ok(ClientMessage::try_from(envelope)?)
}

/// Sends the error frame for a failed request.
fn report(handle: &ConnectionHandle, err: &FeastError) {
    let code = err.error_code();
    let message = if code == ErrorCode::Internal {
        warn!(conn_id = %handle.id(), error = %err, "request failed");
        "internal server error".to_string()
    } else {
        debug!(conn_id = %handle.id(), ?code, error = %err, "request rejected");
        err.to_string()
    };
    handle.send(&ServerMessage::error(code, message));
}

async fn route<S: SessionStore>(
    state: &Shared<S>,
    handle: &mut ConnectionHandle,
    msg: ClientMessage,
) -> Result<(), FeastError> {
    let kind = msg.kind();
    let client_state = handle.client_state();
    if !client_state.allows(kind) {
        return Err(FeastError::rejected(
            ErrorCode::InvalidState,
            format!("{kind} is not allowed while {client_state}"),
        ));
    }

    match msg {
        ClientMessage::JoinQueue(payload) => join_queue(state, handle, payload).await,
        ClientMessage::CreateRoom(payload) => create_room(state, handle, payload).await,
        ClientMessage::JoinRoom(payload) => join_room(state, handle, payload).await,
        ClientMessage::PlaceToken(p) => flow::place_token(state, handle, p.index).await,
        ClientMessage::SelectPlate(p) => {
            flow::select_plate(state, handle, p.index).await;
            Ok(())
        }
        ClientMessage::ConfirmMatch => flow::confirm_match(state, handle).await,
        ClientMessage::AddToken(p) => flow::add_token(state, handle, p.index).await,
        ClientMessage::Reconnect(payload) => reconnect(state, handle, payload).await,
        ClientMessage::LeaveRoom => leave_room(state, handle).await,
    }
}

// ---------------------------------------------------------------------------
// Lobby
// ---------------------------------------------------------------------------

/// Trims and length-checks a nickname.
pub(crate) fn validate_nickname(raw: &str) -> Result<String, FeastError> {
    let nickname = raw.trim();
    let len = nickname.chars().count();
    if len == 0 || len > MAX_NICKNAME_CHARS {
        return Err(FeastError::rejected(
            ErrorCode::InvalidNickname,
            format!("nickname must be 1 to {MAX_NICKNAME_CHARS} characters"),
        ));
    }
    Ok(nickname.to_owned())
}

/// Absent requests, and any below the smallest board, get the default.
fn requested_plates(plate_count: Option<i64>) -> i64 {
    match plate_count {
        Some(n) if n >= MIN_PLATE_COUNT as i64 => n,
        _ => DEFAULT_PLATE_COUNT as i64,
    }
}

/// Moves the connection onto a session id sent in a lobby payload.
fn adopt_session<S: SessionStore>(
    state: &ServerState<S>,
    handle: &mut ConnectionHandle,
    requested: Option<&str>,
) -> Result<(), FeastError> {
    let Some(raw) = requested.filter(|raw| !raw.is_empty()) else {
        return Ok(());
    };
    let session_id = SessionId::parse(raw)
        .ok_or_else(|| FeastError::rejected(ErrorCode::InvalidPayload, "invalid session id"))?;
    if &session_id != handle.session_id() {
        debug!(
            conn_id = %handle.id(),
            from = %handle.session_id(),
            to = %session_id,
            "session adopted"
        );
        *handle = state.registry.rebind(handle, session_id);
    }
    Ok(())
}

/// Gives up any seat the session still holds before it takes a new one.
async fn release_previous_seat<S: SessionStore>(state: &Shared<S>, session_id: &SessionId) {
    let Some((room, slot)) = state.rooms.find_by_session(session_id) else {
        return;
    };
    match room.phase() {
        Phase::Finished => {}
        Phase::Waiting => {
            room.remove_player(slot);
        }
        _ => {
            info!(room_id = %room.id(), slot, "seat abandoned for a new game");
            flow::cancel_forfeit(state, room.id(), slot);
            flow::end_game(state, &room, EndReason::Forfeit, Winner::Player(1 - slot)).await;
        }
    }
}

async fn join_queue<S: SessionStore>(
    state: &Shared<S>,
    handle: &mut ConnectionHandle,
    payload: JoinQueuePayload,
) -> Result<(), FeastError> {
    let nickname = validate_nickname(&payload.nickname)?;
    adopt_session(state, handle, payload.session_id.as_deref())?;
    release_previous_seat(state, handle.session_id()).await;

    let player = Arc::new(Player::new(
        handle.session_id().clone(),
        nickname,
        Some(handle.clone()),
    ));
    // Waiting before the call: a pairing on another task may move us to
    // InGame as soon as we are in the queue.
    handle.set_client_state(ClientState::Waiting);
    let outcome = state
        .matchmaker
        .join_queue(player, Some(handle.clone()), requested_plates(payload.plate_count))
        .inspect_err(|_| handle.set_client_state(ClientState::Lobby))?;

    match outcome {
        JoinOutcome::Queued { position } => {
            handle.send(&ServerMessage::QueueJoined(QueueJoinedPayload { position }));
        }
        JoinOutcome::Matched { room } => start_match(state, &room, None).await,
    }
    Ok(())
}

async fn create_room<S: SessionStore>(
    state: &Shared<S>,
    handle: &mut ConnectionHandle,
    payload: CreateRoomPayload,
) -> Result<(), FeastError> {
    let nickname = validate_nickname(&payload.nickname)?;
    adopt_session(state, handle, payload.session_id.as_deref())?;
    release_previous_seat(state, handle.session_id()).await;

    let room = state
        .rooms
        .create_room(clamp_plate_count(requested_plates(payload.plate_count)))?;
    let player = Player::new(handle.session_id().clone(), nickname, Some(handle.clone()));
    let slot = room.add_player(Arc::new(player))?;

    handle.set_client_state(ClientState::Waiting);
    flow::remember_seat(state, handle.session_id(), room.id(), slot).await;
    flow::persist(state, &room).await;
    handle.send(&ServerMessage::RoomCreated(RoomCreatedPayload {
        room_id: room.id().clone(),
        room_code: room.code().clone(),
    }));
    Ok(())
}

async fn join_room<S: SessionStore>(
    state: &Shared<S>,
    handle: &mut ConnectionHandle,
    payload: JoinRoomPayload,
) -> Result<(), FeastError> {
    let nickname = validate_nickname(&payload.nickname)?;
    let code = RoomCode::parse(&payload.room_code).ok_or_else(|| {
        FeastError::rejected(ErrorCode::InvalidRoomCode, "room codes are 6 letters or digits")
    })?;
    adopt_session(state, handle, payload.session_id.as_deref())?;

    let room = state.rooms.get_by_code(&code).ok_or_else(|| {
        FeastError::rejected(ErrorCode::RoomNotFound, format!("no room with code {code}"))
    })?;
    if room.player_by_session(handle.session_id()).is_some() {
        return Err(FeastError::rejected(
            ErrorCode::JoinFailed,
            "you cannot join your own room",
        ));
    }
    if room.phase() != Phase::Waiting || room.is_full() {
        return Err(RoomError::RoomFull(room.id().clone()).into());
    }
    release_previous_seat(state, handle.session_id()).await;

    let player = Player::new(handle.session_id().clone(), nickname, Some(handle.clone()));
    let slot = room.add_player(Arc::new(player))?;
    if !room.is_full() {
        // The host left while we were joining.
        room.remove_player(slot);
        return Err(RoomError::NotFound(room.id().clone()).into());
    }
    start_match(state, &room, Some(slot)).await;
    Ok(())
}

/// Tells both seats who they play, then starts the game.
///
/// `joiner` is the seat that arrived by invite code; it receives
/// `room_joined` while the host receives `matched`.
async fn start_match<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>, joiner: Option<usize>) {
    let room_code = joiner.map(|_| room.code().clone());
    let mut absent = Vec::new();

    for (slot, player) in room.players().iter().enumerate() {
        let Some(player) = player else {
            continue;
        };
        let payload = MatchedPayload {
            room_id: room.id().clone(),
            room_code: room_code.clone(),
            player_index: slot,
            opponent_nickname: room.opponent_nickname(slot),
        };
        let msg = if joiner == Some(slot) {
            ServerMessage::RoomJoined(payload)
        } else {
            ServerMessage::Matched(payload)
        };
        match state.registry.lookup(player.session_id()) {
            Some(conn) => {
                conn.set_client_state(ClientState::InGame);
                conn.send(&msg);
            }
            None => {
                player.clear_connection();
                absent.push(slot);
            }
        }
        flow::remember_seat(state, player.session_id(), room.id(), slot).await;
    }

    room.start_game();
    room.broadcast_state();
    flow::persist(state, room).await;
    info!(room_id = %room.id(), plates = room.plate_count(), "match started");

    // Gone before the match was announced.
    for slot in absent {
        flow::schedule_forfeit(state, room, slot);
    }
}

// ---------------------------------------------------------------------------
// Reconnect
// ---------------------------------------------------------------------------

async fn reconnect<S: SessionStore>(
    state: &Shared<S>,
    handle: &mut ConnectionHandle,
    payload: ReconnectPayload,
) -> Result<(), FeastError> {
    let session_id = SessionId::parse(&payload.session_id)
        .ok_or_else(|| FeastError::rejected(ErrorCode::InvalidPayload, "invalid session id"))?;

    let (room, slot, restored) = match state.rooms.find_by_session(&session_id) {
        Some((room, slot)) if !room.is_finished() => (room, slot, false),
        _ => restore_room(state, &session_id).await?,
    };
    let player = room
        .player(slot)
        .ok_or_else(|| FeastError::rejected(ErrorCode::PlayerNotFound, "that seat is empty"))?;
    let grace = state.config.reconnect_grace;
    if player.disconnected_for().is_some_and(|gone| gone > grace) {
        return Err(FeastError::rejected(
            ErrorCode::GracePeriodExpired,
            "the reconnect window has closed",
        ));
    }

    *handle = state.registry.rebind(handle, session_id.clone());
    player.set_connection(handle.clone());
    if flow::cancel_forfeit(state, room.id(), slot) {
        debug!(room_id = %room.id(), slot, "pending forfeit cancelled");
    }
    handle.set_client_state(if room.phase() == Phase::Waiting {
        ClientState::Waiting
    } else {
        ClientState::InGame
    });

    room.broadcast(&ServerMessage::Reconnected(ReconnectedPayload { player_index: slot }));
    room.broadcast_state();
    flow::remember_seat(state, &session_id, room.id(), slot).await;
    info!(room_id = %room.id(), slot, restored, "player reconnected");

    if restored {
        resume_restored(state, &room, slot);
    }
    Ok(())
}

/// Rebuilds the session's room from the store and indexes it.
///
/// Returns the indexed room, the session's seat, and whether this call
/// was the one that put the room back.
async fn restore_room<S: SessionStore>(
    state: &Shared<S>,
    session_id: &SessionId,
) -> Result<(Arc<Room>, usize, bool), FeastError> {
    let not_found = || FeastError::rejected(ErrorCode::RoomNotFound, "no game to return to");

    let record = state.store.get_session(session_id).await?.ok_or_else(not_found)?;
    let data = state.store.get_room(&record.room_id).await?.ok_or_else(not_found)?;
    if data.state.phase == Phase::Finished {
        return Err(not_found());
    }
    let seated = data.players.iter().flatten().any(|p| &p.session_id == session_id);
    if !seated {
        return Err(FeastError::rejected(
            ErrorCode::PlayerNotFound,
            "you are not seated in that room",
        ));
    }

    let restored = Arc::new(Room::restore(
        &data,
        state.rooms.config().clone(),
        Arc::clone(&state.registry),
        state.rooms.events().cloned(),
    )?);
    let room = state.rooms.insert(Arc::clone(&restored))?;
    if room.is_finished() {
        return Err(not_found());
    }
    let (slot, _) = room.player_by_session(session_id).ok_or_else(|| {
        FeastError::rejected(ErrorCode::PlayerNotFound, "you are not seated in that room")
    })?;
    let fresh = Arc::ptr_eq(&room, &restored);
    Ok((room, slot, fresh))
}

/// Restarts what a restored room lost with the process: a follow-up that
/// was still due, the turn clock, and the forfeit clocks of seats nobody
/// came back to.
fn resume_restored<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>, slot: usize) {
    let phase = room.phase();
    match room.pending_step() {
        Some(PendingStep::AdvancePlacement) => {
            debug!(room_id = %room.id(), "resuming cut-off placement");
            flow::schedule_placement_advance(state, room, None);
        }
        Some(PendingStep::Reveal(reveal)) => {
            debug!(room_id = %room.id(), plates = ?reveal.plates, "resuming cut-off reveal");
            flow::schedule_match_verdict(state, room, room.current_turn(), reveal);
        }
        Some(PendingStep::TurnPass) => {
            debug!(room_id = %room.id(), "resuming cut-off turn pass");
            flow::schedule_turn_pass(state, room);
        }
        None if phase == Phase::Matching => flow::start_turn_timer(state, room),
        None => {}
    }
    if phase == Phase::Waiting {
        return;
    }
    for (other, player) in room.players().iter().enumerate() {
        if other != slot && player.as_ref().is_some_and(|p| !p.is_connected()) {
            flow::schedule_forfeit(state, room, other);
        }
    }
}

// ---------------------------------------------------------------------------
// Leaving
// ---------------------------------------------------------------------------

async fn leave_room<S: SessionStore>(
    state: &Shared<S>,
    handle: &ConnectionHandle,
) -> Result<(), FeastError> {
    handle.set_client_state(ClientState::Lobby);
    if state.matchmaker.leave_queue(handle.session_id()) {
        info!(session_id = %handle.session_id(), "left the queue");
        return Ok(());
    }

    let (room, slot) = flow::seat(state, handle)?;
    if let Some(player) = room.player(slot) {
        player.clear_connection();
    }
    info!(room_id = %room.id(), slot, "player left");
    depart(state, &room, slot).await;
    Ok(())
}

/// Runs when the socket closes.
pub(crate) async fn disconnect<S: SessionStore>(state: &Shared<S>, handle: &ConnectionHandle) {
    let current = state.registry.unregister(handle);
    if state.matchmaker.leave_queue_if(handle.session_id(), handle.id()) {
        debug!(session_id = %handle.session_id(), "removed from the queue");
    }
    info!(
        conn_id = %handle.id(),
        session_id = %handle.session_id(),
        current,
        "client disconnected"
    );

    let Some((room, slot)) = state.rooms.find_by_session(handle.session_id()) else {
        return;
    };
    let Some(player) = room.player(slot) else {
        return;
    };
    if !player.clear_connection_if(handle) {
        debug!(room_id = %room.id(), slot, "stale connection, seat kept");
        return;
    }
    depart(state, &room, slot).await;
}

/// A seat's player is gone. Before the game starts the seat is vacated;
/// during it the opponent is told and the forfeit clock starts.
async fn depart<S: SessionStore>(state: &Shared<S>, room: &Arc<Room>, slot: usize) {
    match room.phase() {
        Phase::Finished => {}
        Phase::Waiting => {
            if let Some(player) = room.remove_player(slot) {
                flow::forget_seat(state, player.session_id(), room.id()).await;
            }
        }
        _ => {
            let grace = state.config.reconnect_grace;
            room.send_to(
                1 - slot,
                &ServerMessage::PlayerLeft(PlayerLeftPayload {
                    player_index: slot,
                    grace_period_seconds: grace.as_secs(),
                }),
            );
            room.broadcast_state();
            flow::schedule_forfeit(state, room, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_nickname_trims() {
        assert_eq!(validate_nickname("  Ana  ").unwrap(), "Ana");
    }

    #[test]
    fn test_validate_nickname_rejects_blank_and_long() {
        let blank = validate_nickname("   ").unwrap_err();
        assert_eq!(blank.error_code(), ErrorCode::InvalidNickname);

        assert!(validate_nickname(&"a".repeat(MAX_NICKNAME_CHARS)).is_ok());
        let long = validate_nickname(&"a".repeat(MAX_NICKNAME_CHARS + 1)).unwrap_err();
        assert_eq!(long.error_code(), ErrorCode::InvalidNickname);
    }

    #[test]
    fn test_validate_nickname_counts_chars_not_bytes() {
        assert!(validate_nickname(&"é".repeat(MAX_NICKNAME_CHARS)).is_ok());
    }

    #[test]
    fn test_requested_plates_defaults_when_absent_or_below_minimum() {
        assert_eq!(requested_plates(None), 20);
        assert_eq!(requested_plates(Some(0)), 20);
        assert_eq!(requested_plates(Some(-3)), 20);
        assert_eq!(requested_plates(Some(2)), 20);
        assert_eq!(requested_plates(Some(3)), 20);
        assert_eq!(requested_plates(Some(4)), 4);
        assert_eq!(requested_plates(Some(7)), 7);
    }
}
