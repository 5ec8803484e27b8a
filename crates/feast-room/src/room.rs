//! A two-seat game room.
//!
//! Every mutation goes through one `RwLock` around the seats, the
//! [`GameState`], and the `resolving` flag. Actions taken on behalf of a
//! player check both the phase and that it is that player's turn; a
//! mismatch is [`RoomError::Rejected`] with nothing changed.
//!
//! `resolving` covers the gap between an accepted action and its delayed
//! follow-up (a placement waiting to be covered, a reveal waiting to be
//! scored, a timeout waiting to pass the turn). While it is set, further
//! placements, selections and confirms are rejected.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use feast_protocol::{
    GameStatePayload, MessageType, Phase, PlayerView, RoomCode, RoomId, ServerMessage, SessionId,
};
use feast_session::{ConnectionHandle, ConnectionRegistry, Player, PlayerData, RoomData};
use feast_tick::TurnTimer;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{
    clamp_plate_count, starting_tokens, RoomConfig, MATCH_FAIL_PENALTY, TIMEOUT_PENALTY,
};
use crate::game::{GameState, MatchReveal, PendingStep};
use crate::RoomError;

/// Notifications a room pushes to whoever owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Both seats are now empty.
    Empty(RoomId),
}

/// Sending half of the room event channel.
pub type RoomEvents = mpsc::UnboundedSender<RoomEvent>;

/// Result of comparing balances at the end of a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    Player(usize),
    Draw,
}

impl Winner {
    /// 1-indexed seat for the wire, 0 for a draw.
    pub fn display_index(self) -> usize {
        match self {
            Winner::Player(slot) => slot + 1,
            Winner::Draw => 0,
        }
    }
}

/// Result of a successful add-token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenPlaced {
    pub plate: usize,
    pub plate_tokens: u32,
    /// The acting player's balance after paying the token.
    pub balance: i32,
    /// Whether that balance reached zero or below.
    pub won: bool,
}

struct RoomInner {
    players: [Option<Arc<Player>>; 2],
    game: GameState,
    resolving: bool,
}

/// A room with two seats, a board, and a turn clock.
pub struct Room {
    id: RoomId,
    code: RoomCode,
    plate_count: usize,
    created_at: u64,
    config: RoomConfig,
    inner: RwLock<RoomInner>,
    timer: TurnTimer,
    registry: Arc<ConnectionRegistry>,
    events: Option<RoomEvents>,
}

impl Room {
    /// Creates an empty room. `plate_count` is clamped to a legal board.
    pub fn new(
        id: RoomId,
        code: RoomCode,
        plate_count: usize,
        config: RoomConfig,
        registry: Arc<ConnectionRegistry>,
        events: Option<RoomEvents>,
    ) -> Self {
        let plate_count = clamp_plate_count(i64::try_from(plate_count).unwrap_or(i64::MAX));
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        Self {
            id,
            code,
            plate_count,
            created_at,
            timer: TurnTimer::new(config.tick_period),
            inner: RwLock::new(RoomInner {
                players: [None, None],
                game: GameState::new(plate_count, config.turn_time_limit),
                resolving: false,
            }),
            config,
            registry,
            events,
        }
    }

    /// Rebuilds a room from a stored record. Restored players start
    /// disconnected.
    ///
    /// A record saved between an action and its delayed follow-up comes
    /// back resolving; [`Room::pending_step`] says what is still owed.
    pub fn restore(
        data: &RoomData,
        config: RoomConfig,
        registry: Arc<ConnectionRegistry>,
        events: Option<RoomEvents>,
    ) -> Result<Self, RoomError> {
        if data.plate_count != data.state.plates.len() {
            return Err(RoomError::InvalidData(format!(
                "plate count {} does not match {} plates",
                data.plate_count,
                data.state.plates.len()
            )));
        }
        let game = GameState::from_data(&data.state, config.turn_time_limit)
            .map_err(RoomError::InvalidData)?;
        let players = data.players.clone().map(|slot| {
            slot.map(|p| {
                let player = Player::new(p.session_id, p.nickname, None);
                player.set_tokens(p.tokens);
                Arc::new(player)
            })
        });

        let resolving = game.pending_step().is_some();
        info!(room_id = %data.id, phase = %game.phase(), resolving, "room restored");
        Ok(Self {
            id: data.id.clone(),
            code: data.code.clone(),
            plate_count: data.plate_count,
            created_at: data.created_at,
            timer: TurnTimer::new(config.tick_period),
            inner: RwLock::new(RoomInner {
                players,
                game,
                resolving,
            }),
            config,
            registry,
            events,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, RoomInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RoomInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `action` if it is `slot`'s turn in `phase`.
    fn act<T>(
        &self,
        slot: usize,
        phase: Phase,
        action: impl FnOnce(&mut RoomInner) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        let mut inner = self.write();
        if inner.game.phase() != phase || inner.game.current_turn() != slot {
            debug!(room_id = %self.id, slot, %phase, "action out of turn or phase");
            return Err(RoomError::Rejected);
        }
        action(&mut inner)
    }

    // -- Identity -----------------------------------------------------------

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn plate_count(&self) -> usize {
        self.plate_count
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.read().game.phase()
    }

    pub fn current_turn(&self) -> usize {
        self.read().game.current_turn()
    }

    pub fn time_left(&self) -> u32 {
        self.read().game.time_left()
    }

    pub fn max_round(&self) -> u32 {
        self.read().game.max_round()
    }

    pub fn is_finished(&self) -> bool {
        self.read().game.is_finished()
    }

    /// Whether an accepted action is still waiting for its follow-up.
    pub fn is_resolving(&self) -> bool {
        self.read().resolving
    }

    /// The follow-up a restored room still owes, if it came back resolving.
    pub fn pending_step(&self) -> Option<PendingStep> {
        let inner = self.read();
        if !inner.resolving {
            return None;
        }
        inner.game.pending_step()
    }

    pub fn has_remaining_pairs(&self) -> bool {
        self.read().game.has_remaining_pairs()
    }

    // -- Seats --------------------------------------------------------------

    /// Seats a player in the first empty slot.
    pub fn add_player(&self, player: Arc<Player>) -> Result<usize, RoomError> {
        let mut inner = self.write();
        let Some(slot) = inner.players.iter().position(Option::is_none) else {
            return Err(RoomError::RoomFull(self.id.clone()));
        };
        info!(room_id = %self.id, slot, nickname = player.nickname(), "player seated");
        inner.players[slot] = Some(player);
        Ok(slot)
    }

    /// Vacates a slot. Emits [`RoomEvent::Empty`] when no one is left.
    pub fn remove_player(&self, slot: usize) -> Option<Arc<Player>> {
        let (removed, empty) = {
            let mut inner = self.write();
            let removed = inner.players.get_mut(slot).and_then(Option::take);
            (removed, inner.players.iter().all(Option::is_none))
        };
        if let Some(player) = &removed {
            info!(room_id = %self.id, slot, nickname = player.nickname(), "player removed");
            if empty {
                self.emit(RoomEvent::Empty(self.id.clone()));
            }
        }
        removed
    }

    fn emit(&self, event: RoomEvent) {
        if let Some(events) = &self.events {
            if events.send(event).is_err() {
                debug!(room_id = %self.id, "room event receiver gone");
            }
        }
    }

    pub fn player(&self, slot: usize) -> Option<Arc<Player>> {
        self.read().players.get(slot).cloned().flatten()
    }

    pub fn players(&self) -> [Option<Arc<Player>>; 2] {
        self.read().players.clone()
    }

    pub fn player_by_session(&self, session_id: &SessionId) -> Option<(usize, Arc<Player>)> {
        self.read()
            .players
            .iter()
            .enumerate()
            .find_map(|(slot, p)| {
                p.as_ref()
                    .filter(|p| p.session_id() == session_id)
                    .map(|p| (slot, Arc::clone(p)))
            })
    }

    pub fn opponent_nickname(&self, slot: usize) -> String {
        self.player(1 - slot.min(1))
            .map(|p| p.nickname().to_owned())
            .unwrap_or_default()
    }

    pub fn player_count(&self) -> usize {
        self.read().players.iter().flatten().count()
    }

    pub fn is_full(&self) -> bool {
        self.player_count() == 2
    }

    // -- Game flow ----------------------------------------------------------

    /// `Waiting → Placement`.
    pub fn start_game(&self) -> bool {
        let started = self.write().game.start();
        if started {
            info!(room_id = %self.id, plates = self.plate_count, "game started");
        }
        started
    }

    pub fn place_token(&self, slot: usize, index: usize) -> Result<(), RoomError> {
        self.act(slot, Phase::Placement, |inner| {
            if inner.resolving || !inner.game.place_token(index) {
                return Err(RoomError::Rejected);
            }
            inner.resolving = true;
            Ok(())
        })
    }

    pub fn cover_plate(&self, index: usize) -> bool {
        self.write().game.cover_plate(index)
    }

    /// Passes the placement turn and clears the pending placement.
    ///
    /// Returns `Ok(true)` when placement is over; the room is then in
    /// `Matching` and both balances have been set.
    pub fn advance_placement(&self) -> Result<bool, RoomError> {
        let mut inner = self.write();
        if inner.game.phase() != Phase::Placement {
            return Err(RoomError::Rejected);
        }
        inner.resolving = false;
        if !inner.game.advance_placement_turn() {
            return Ok(false);
        }

        inner.game.enter_matching();
        let tokens = starting_tokens(inner.game.max_round());
        for player in inner.players.iter().flatten() {
            player.set_tokens(tokens);
        }
        info!(room_id = %self.id, tokens, "matching phase entered");
        Ok(true)
    }

    pub fn select_plate(&self, slot: usize, index: usize) -> Result<(), RoomError> {
        self.act(slot, Phase::Matching, |inner| {
            if inner.resolving || !inner.game.select_plate(index) {
                return Err(RoomError::Rejected);
            }
            Ok(())
        })
    }

    /// Reveals the selected pair and stops the turn clock.
    pub fn confirm_match(&self, slot: usize) -> Result<MatchReveal, RoomError> {
        let reveal = self.act(slot, Phase::Matching, |inner| {
            if inner.resolving {
                return Err(RoomError::Rejected);
            }
            let reveal = inner.game.confirm_match().ok_or(RoomError::NotTwoSelected)?;
            inner.resolving = true;
            Ok(reveal)
        })?;
        self.timer.stop();
        debug!(room_id = %self.id, slot, matched = reveal.matched, "match confirmed");
        Ok(reveal)
    }

    /// Opens the add-token phase for the pair just revealed.
    pub fn enter_add_token_phase(&self) -> bool {
        let mut inner = self.write();
        if inner.game.phase() != Phase::Matching || inner.game.selected().len() != 2 {
            return false;
        }
        inner.game.enter_add_token_phase();
        inner.resolving = false;
        true
    }

    /// Adds a token to one of the matched plates, paid from the acting
    /// player's balance.
    pub fn add_token(&self, slot: usize, index: usize) -> Result<TokenPlaced, RoomError> {
        self.act(slot, Phase::AddToken, |inner| {
            let player = inner.players[slot].clone().ok_or(RoomError::Rejected)?;
            if !inner.game.add_token(index) {
                return Err(RoomError::Rejected);
            }
            let plate_tokens = inner.game.plate(index).map_or(0, |p| p.token_count);
            let balance = player.add_tokens(-1);
            Ok(TokenPlaced {
                plate: index,
                plate_tokens,
                balance,
                won: balance <= 0,
            })
        })
    }

    /// +1 to `slot`'s balance. Returns the new balance.
    pub fn apply_match_penalty(&self, slot: usize) -> Option<i32> {
        self.player(slot).map(|p| p.add_tokens(MATCH_FAIL_PENALTY))
    }

    /// +2 to whoever holds the matching turn, and holds further actions
    /// until the turn passes. Returns the penalised slot.
    pub fn apply_timeout_penalty(&self) -> Option<usize> {
        let mut inner = self.write();
        if inner.game.phase() != Phase::Matching || inner.resolving {
            return None;
        }
        let slot = inner.game.current_turn();
        inner.resolving = true;
        if let Some(player) = &inner.players[slot] {
            player.add_tokens(TIMEOUT_PENALTY);
        }
        Some(slot)
    }

    /// Passes the matching turn.
    ///
    /// `Ok(false)` when no equal pair is left on the board; nothing is
    /// changed and the game should end.
    pub fn advance_matching(&self) -> Result<bool, RoomError> {
        let mut inner = self.write();
        if !matches!(inner.game.phase(), Phase::Matching | Phase::AddToken) {
            return Err(RoomError::Rejected);
        }
        if !inner.game.has_remaining_pairs() {
            return Ok(false);
        }
        inner.game.advance_matching_turn();
        inner.resolving = false;
        Ok(true)
    }

    /// Ends the game. Returns false if it had already ended.
    pub fn finish(&self) -> bool {
        {
            let mut inner = self.write();
            if inner.game.is_finished() {
                return false;
            }
            inner.game.finish();
            inner.resolving = false;
        }
        self.timer.stop();
        info!(room_id = %self.id, "game finished");
        true
    }

    /// Lower balance wins. An empty seat counts as an infinite balance.
    pub fn winner(&self) -> Winner {
        let inner = self.read();
        let balance = |slot: usize| {
            inner.players[slot]
                .as_ref()
                .map_or(i64::MAX, |p| i64::from(p.tokens()))
        };
        let (a, b) = (balance(0), balance(1));
        match a.cmp(&b) {
            std::cmp::Ordering::Less => Winner::Player(0),
            std::cmp::Ordering::Greater => Winner::Player(1),
            std::cmp::Ordering::Equal => Winner::Draw,
        }
    }

    pub fn final_tokens(&self) -> [i32; 2] {
        self.read()
            .players
            .each_ref()
            .map(|p| p.as_ref().map_or(0, |p| p.tokens()))
    }

    // -- Turn timer ---------------------------------------------------------

    /// Starts the matching clock from the configured limit, replacing any
    /// running one. `on_tick` sees the seconds left after each tick and
    /// `on_timeout` runs once when they reach zero.
    pub fn start_timer<T, O>(self: &Arc<Self>, mut on_tick: T, on_timeout: O)
    where
        T: FnMut(u32) + Send + 'static,
        O: FnOnce() + Send + 'static,
    {
        let limit = self.config.turn_time_limit;
        self.write().game.set_time_left(limit);
        let weak: Weak<Room> = Arc::downgrade(self);
        self.timer.start(
            limit,
            move |left| {
                let Some(room) = weak.upgrade() else {
                    return;
                };
                room.write().game.set_time_left(left);
                on_tick(left);
            },
            on_timeout,
        );
    }

    pub fn stop_timer(&self) -> bool {
        self.timer.stop()
    }

    pub fn timer_running(&self) -> bool {
        self.timer.is_running()
    }

    // -- Projection & fan-out -----------------------------------------------

    /// The game as `viewer` should see it.
    ///
    /// During `Matching` the player not on turn receives the selection as
    /// `opponentSelectedPlates`; everywhere else it is sent verbatim.
    pub fn state_for(&self, viewer: Option<usize>) -> GameStatePayload {
        Self::project(&self.read(), viewer)
    }

    fn project(inner: &RoomInner, viewer: Option<usize>) -> GameStatePayload {
        let game = &inner.game;
        let selected = game.selected().to_vec();
        let (selected_plates, opponent_selected_plates) = match viewer {
            Some(v) if game.phase() == Phase::Matching && v != game.current_turn() => {
                (Vec::new(), Some(selected))
            }
            _ => (selected, None),
        };

        GameStatePayload {
            phase: game.phase(),
            current_turn: game.current_turn(),
            placement_round: game.placement_round(),
            max_round: game.max_round(),
            time_left: game.time_left(),
            players: inner
                .players
                .iter()
                .map(|p| {
                    p.as_ref().map_or_else(PlayerView::default, |p| PlayerView {
                        nickname: p.nickname().to_owned(),
                        tokens: p.tokens(),
                        is_connected: p.is_connected(),
                    })
                })
                .collect(),
            plates: game.plates().iter().map(|p| p.view()).collect(),
            selected_plates,
            opponent_selected_plates,
            matched_plates: game.matched().to_vec(),
            last_action_plate: game.last_action_plate(),
            message: None,
            message_type: None,
        }
    }

    /// The live connection for a seat, looked up at call time.
    fn live_connection(&self, player: &Player) -> Option<ConnectionHandle> {
        if !player.is_connected() {
            return None;
        }
        self.registry.lookup(player.session_id())
    }

    pub fn broadcast_state(&self) {
        self.fan_out_state(None);
    }

    /// Broadcasts the state with a status line attached.
    pub fn broadcast_state_with(&self, message: impl Into<String>, kind: MessageType) {
        self.fan_out_state(Some((message.into(), kind)));
    }

    fn fan_out_state(&self, note: Option<(String, MessageType)>) {
        let snapshots: Vec<(Arc<Player>, GameStatePayload)> = {
            let inner = self.read();
            inner
                .players
                .iter()
                .enumerate()
                .filter_map(|(slot, p)| {
                    p.as_ref()
                        .map(|p| (Arc::clone(p), Self::project(&inner, Some(slot))))
                })
                .collect()
        };

        for (player, mut state) in snapshots {
            let Some(conn) = self.live_connection(&player) else {
                continue;
            };
            if let Some((message, kind)) = &note {
                state.message = Some(message.clone());
                state.message_type = Some(*kind);
            }
            conn.send(&ServerMessage::GameState(state));
        }
    }

    /// Sends the same message to every connected seat.
    pub fn broadcast(&self, msg: &ServerMessage) {
        for player in self.players().iter().flatten() {
            if let Some(conn) = self.live_connection(player) {
                conn.send(msg);
            }
        }
    }

    /// Sends to one seat. Returns false if nobody is connected there.
    pub fn send_to(&self, slot: usize, msg: &ServerMessage) -> bool {
        self.player(slot)
            .and_then(|p| self.live_connection(&p))
            .is_some_and(|conn| conn.send(msg))
    }

    // -- Persistence --------------------------------------------------------

    pub fn to_data(&self) -> RoomData {
        let inner = self.read();
        RoomData {
            id: self.id.clone(),
            code: self.code.clone(),
            plate_count: self.plate_count,
            players: inner.players.each_ref().map(|p| {
                p.as_ref().map(|p| PlayerData {
                    id: p.id().clone(),
                    nickname: p.nickname().to_owned(),
                    session_id: p.session_id().clone(),
                    tokens: p.tokens(),
                })
            }),
            state: inner.game.to_data(),
            created_at: self.created_at,
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("plate_count", &self.plate_count)
            .finish_non_exhaustive()
    }
}
