//! Game rooms and matchmaking for the Memory Feast server.
//!
//! # Key types
//!
//! - [`GameState`]: the pure board and phase machine
//! - [`Room`]: two seats around a `GameState`, with turn guards, the
//!   turn clock, per-player projection and fan-out
//! - [`RoomManager`]: creates rooms and indexes them by id and invite code
//! - [`Matchmaker`]: FIFO queue that hands pairs to a [`MatchHandler`]
//! - [`RoomConfig`] / [`QueueConfig`]: timing and board settings
//!
//! Rooms never call back into the manager or the matchmaker. The only
//! upward signal is [`RoomEvent::Empty`] on an unbounded channel.

mod config;
mod error;
mod game;
mod manager;
mod matchmaker;
mod room;

pub use config::{
    clamp_plate_count, max_round_for, starting_tokens, QueueConfig, RoomConfig,
    DEFAULT_PLATE_COUNT, MATCH_FAIL_PENALTY, MAX_PLATE_COUNT, MIN_PLATE_COUNT,
    MIN_STARTING_TOKENS, TIMEOUT_PENALTY, TURN_TIME_LIMIT_SECS,
};
pub use error::RoomError;
pub use game::{GameState, MatchReveal, PendingStep, Plate};
pub use manager::{RoomManager, MAX_CODE_ATTEMPTS};
pub use matchmaker::{JoinOutcome, MatchHandler, Matchmaker, QueueEntry};
pub use room::{Room, RoomEvent, RoomEvents, TokenPlaced, Winner};
