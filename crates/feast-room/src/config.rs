//! Room and queue configuration plus the board-size rules.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Plate count used when a client does not ask for one.
pub const DEFAULT_PLATE_COUNT: usize = 20;

/// Smallest legal board.
pub const MIN_PLATE_COUNT: usize = 4;

/// Largest legal board.
pub const MAX_PLATE_COUNT: usize = 20;

/// Seconds a player has to act on a matching turn.
pub const TURN_TIME_LIMIT_SECS: u32 = 60;

/// Floor for the balance each player starts the matching phase with.
pub const MIN_STARTING_TOKENS: i32 = 5;

/// Tokens added to a player's balance after a failed match.
pub const MATCH_FAIL_PENALTY: i32 = 1;

/// Tokens added to a player's balance when their turn times out.
pub const TIMEOUT_PENALTY: i32 = 2;

/// Clamps a requested plate count into `[MIN, MAX]`, rounding odd
/// values up to the next even number.
///
/// ```
/// use feast_room::clamp_plate_count;
///
/// assert_eq!(clamp_plate_count(-1), 4);
/// assert_eq!(clamp_plate_count(5), 6);
/// assert_eq!(clamp_plate_count(21), 20);
/// ```
pub fn clamp_plate_count(requested: i64) -> usize {
    let clamped = requested.clamp(MIN_PLATE_COUNT as i64, MAX_PLATE_COUNT as i64) as usize;
    // MAX is even, so rounding up never leaves the range.
    clamped + clamped % 2
}

/// Number of placement rounds for a board: `max(1, plates/2 - 1)`.
pub fn max_round_for(plate_count: usize) -> u32 {
    let rounds = (plate_count / 2).saturating_sub(1);
    u32::try_from(rounds).unwrap_or(u32::MAX).max(1)
}

/// Balance each player starts the matching phase with.
pub fn starting_tokens(max_round: u32) -> i32 {
    i32::try_from(max_round)
        .unwrap_or(i32::MAX)
        .saturating_add(1)
        .max(MIN_STARTING_TOKENS)
}

// ---------------------------------------------------------------------------
// RoomConfig
// ---------------------------------------------------------------------------

/// Per-room settings shared by every room a manager creates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Seconds on the clock at the start of each matching turn.
    pub turn_time_limit: u32,

    /// How often the turn clock ticks. One second in production.
    pub tick_period: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            turn_time_limit: TURN_TIME_LIMIT_SECS,
            tick_period: Duration::from_secs(1),
        }
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Matchmaking queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// How long an entry may wait before it is evicted.
    pub timeout: Duration,

    /// How often the sweeper looks for timed-out entries.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
        }
    }
}
