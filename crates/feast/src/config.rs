//! Server-wide settings.

use std::time::Duration;

use feast_room::{QueueConfig, RoomConfig};
use serde::{Deserialize, Serialize};

/// Everything a [`FeastServer`](crate::FeastServer) needs to know besides
/// its store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    pub bind_addr: String,
    /// Browser origins allowed to open a socket. Empty means localhost
    /// pages only; `*` is refused.
    pub allowed_origins: Vec<String>,
    /// How long a disconnected player's seat is held before forfeiting.
    pub reconnect_grace: Duration,
    pub room: RoomConfig,
    pub queue: QueueConfig,
    /// Delay between a placement and the plate being covered.
    pub placement_reveal_delay: Duration,
    /// Delay between a confirm and its outcome.
    pub match_reveal_delay: Duration,
    /// Delay between a failed match (or a timeout) and the turn passing.
    pub turn_pass_delay: Duration,
    pub ping_interval: Duration,
    /// A connection silent for longer than this is closed.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            allowed_origins: Vec::new(),
            reconnect_grace: Duration::from_secs(30),
            room: RoomConfig::default(),
            queue: QueueConfig::default(),
            placement_reveal_delay: Duration::from_millis(1500),
            match_reveal_delay: Duration::from_secs(2),
            turn_pass_delay: Duration::from_secs(2),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(75),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_game_timings() {
        let config = ServerConfig::default();
        assert_eq!(config.reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.placement_reveal_delay, Duration::from_millis(1500));
        assert_eq!(config.match_reveal_delay, Duration::from_secs(2));
        assert_eq!(config.turn_pass_delay, Duration::from_secs(2));
        assert!(config.idle_timeout > config.ping_interval);
        assert_eq!(config.room.turn_time_limit, 60);
        assert_eq!(config.queue.timeout, Duration::from_secs(60));
        assert!(config.allowed_origins.is_empty());
    }
}
