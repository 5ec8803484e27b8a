//! A player: durable identity decoupled from any one connection.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use feast_protocol::{PlayerId, SessionId};
use tokio::time::Instant;

use crate::ConnectionHandle;

#[derive(Debug)]
struct Link {
    connection: Option<ConnectionHandle>,
    disconnected_at: Option<Instant>,
}

/// A player in the lobby, the queue or a room.
///
/// The connection slot has its own lock so a reconnect never needs the
/// room's lock. The token balance is a separate atomic; callers that read
/// both must not assume they are a consistent snapshot.
#[derive(Debug)]
pub struct Player {
    id: PlayerId,
    nickname: String,
    session_id: SessionId,
    tokens: AtomicI32,
    link: Mutex<Link>,
}

impl Player {
    /// Creates a player, optionally already bound to a connection.
    ///
    /// A player created without a connection counts as disconnected
    /// from this moment.
    pub fn new(
        session_id: SessionId,
        nickname: impl Into<String>,
        connection: Option<ConnectionHandle>,
    ) -> Self {
        let disconnected_at = connection.is_none().then(Instant::now);
        Self {
            id: PlayerId::for_session(&session_id),
            nickname: nickname.into(),
            session_id,
            tokens: AtomicI32::new(0),
            link: Mutex::new(Link {
                connection,
                disconnected_at,
            }),
        }
    }

    pub fn id(&self) -> &PlayerId {
        &self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Current token balance. May be zero or negative once the player wins.
    pub fn tokens(&self) -> i32 {
        self.tokens.load(Ordering::Acquire)
    }

    pub fn set_tokens(&self, tokens: i32) {
        self.tokens.store(tokens, Ordering::Release);
    }

    /// Adjusts the balance and returns the new value. No floor is applied.
    pub fn add_tokens(&self, delta: i32) -> i32 {
        self.tokens.fetch_add(delta, Ordering::AcqRel) + delta
    }

    fn link(&self) -> std::sync::MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bound connection, if any.
    pub fn connection(&self) -> Option<ConnectionHandle> {
        self.link().connection.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.link().connection.is_some()
    }

    /// Binds a (new) connection, replacing whatever was there.
    pub fn set_connection(&self, connection: ConnectionHandle) {
        let mut link = self.link();
        link.connection = Some(connection);
        link.disconnected_at = None;
    }

    /// Unconditionally drops the connection and starts the disconnect
    /// clock. Returns the handle that was bound.
    pub fn clear_connection(&self) -> Option<ConnectionHandle> {
        let mut link = self.link();
        let previous = link.connection.take();
        if previous.is_some() || link.disconnected_at.is_none() {
            link.disconnected_at = Some(Instant::now());
        }
        previous
    }

    /// Drops the connection only if it is exactly `expected`.
    ///
    /// Returns `false` and leaves the player untouched when a newer
    /// connection has been bound in the meantime.
    pub fn clear_connection_if(&self, expected: &ConnectionHandle) -> bool {
        let mut link = self.link();
        if !link.connection.as_ref().is_some_and(|c| c.same_as(expected)) {
            return false;
        }
        link.connection = None;
        link.disconnected_at = Some(Instant::now());
        true
    }

    /// How long the player has been without a connection.
    pub fn disconnected_for(&self) -> Option<Duration> {
        self.link().disconnected_at.map(|at| at.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::ConnectionRegistry;

    fn handle(registry: &ConnectionRegistry, session: &str) -> ConnectionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        registry.register(SessionId::new(session), tx)
    }

    #[test]
    fn test_new_player_with_connection_is_connected() {
        let registry = ConnectionRegistry::new();
        let conn = handle(&registry, "s1");
        let player = Player::new(SessionId::new("s1"), "mina", Some(conn));

        assert!(player.is_connected());
        assert!(player.disconnected_for().is_none());
        assert_eq!(player.nickname(), "mina");
        assert_eq!(player.id().as_str(), "s1");
    }

    #[test]
    fn test_new_player_without_connection_counts_as_disconnected() {
        let player = Player::new(SessionId::new("s1"), "mina", None);
        assert!(!player.is_connected());
        assert!(player.disconnected_for().is_some());
    }

    #[test]
    fn test_clear_connection_if_matching_handle_clears() {
        let registry = ConnectionRegistry::new();
        let conn = handle(&registry, "s1");
        let player = Player::new(SessionId::new("s1"), "mina", Some(conn.clone()));

        assert!(player.clear_connection_if(&conn));
        assert!(!player.is_connected());
        assert!(player.disconnected_for().is_some());
    }

    #[test]
    fn test_clear_connection_if_stale_handle_is_noop() {
        let registry = ConnectionRegistry::new();
        let old = handle(&registry, "s1");
        let new = handle(&registry, "s1");
        let player = Player::new(SessionId::new("s1"), "mina", Some(old.clone()));

        // Reconnect binds the new socket, then the old socket's teardown runs.
        player.set_connection(new.clone());
        assert!(!player.clear_connection_if(&old));
        assert!(player.connection().unwrap().same_as(&new));
        assert!(player.disconnected_for().is_none());
    }

    #[test]
    fn test_clear_connection_if_when_already_cleared_returns_false() {
        let registry = ConnectionRegistry::new();
        let conn = handle(&registry, "s1");
        let player = Player::new(SessionId::new("s1"), "mina", Some(conn.clone()));
        player.clear_connection();
        assert!(!player.clear_connection_if(&conn));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_for_tracks_elapsed_time() {
        let registry = ConnectionRegistry::new();
        let conn = handle(&registry, "s1");
        let player = Player::new(SessionId::new("s1"), "mina", Some(conn));

        player.clear_connection();
        tokio::time::advance(Duration::from_secs(12)).await;
        let elapsed = player.disconnected_for().unwrap();
        assert!(elapsed >= Duration::from_secs(12));

        let registry2 = ConnectionRegistry::new();
        player.set_connection(handle(&registry2, "s1"));
        assert!(player.disconnected_for().is_none());
    }

    #[test]
    fn test_add_tokens_has_no_floor() {
        let player = Player::new(SessionId::new("s1"), "mina", None);
        player.set_tokens(1);
        assert_eq!(player.add_tokens(-1), 0);
        assert_eq!(player.add_tokens(-1), -1);
        assert_eq!(player.add_tokens(2), 1);
        assert_eq!(player.tokens(), 1);
    }
}
