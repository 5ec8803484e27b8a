//! The connection registry: which socket currently speaks for which
//! session.
//!
//! A browser tab can drop and reconnect at any moment, and the old
//! socket's teardown may run *after* the new socket registered. The
//! registry therefore never removes by session id alone: every
//! registration produces a fresh [`ConnectionHandle`] with its own
//! [`ConnectionId`], and [`ConnectionRegistry::unregister`] only removes
//! the entry if it is still that exact handle.
//!
//! ```text
//! register(s, tx1) → h1          lookup(s) = h1
//! register(s, tx2) → h2          h1 closed, lookup(s) = h2
//! unregister(h1)   → false       lookup(s) = h2   (stale teardown ignored)
//! unregister(h2)   → true        lookup(s) = none
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use feast_protocol::{ClientState, Codec, JsonCodec, ServerMessage, SessionId};
use feast_transport::ConnectionId;
use tokio::sync::mpsc;

/// An item queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// An encoded message.
    Frame(Vec<u8>),
    /// Close the socket after flushing everything queued before this.
    Close,
}

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// Receiving half of a connection's outbound queue, drained by the writer.
pub type OutboundReceiver = mpsc::UnboundedReceiver<Outbound>;

// ---------------------------------------------------------------------------
// ConnectionHandle
// ---------------------------------------------------------------------------

struct HandleInner {
    id: ConnectionId,
    session_id: SessionId,
    outbound: OutboundSender,
    closed: AtomicBool,
    state: Mutex<ClientState>,
}

/// A cheap, cloneable reference to one registered connection.
///
/// Sending never blocks: messages are encoded and pushed onto an
/// unbounded queue that the connection's writer task drains. A send to a
/// closed or vanished connection is dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    fn new(id: ConnectionId, session_id: SessionId, outbound: OutboundSender) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                session_id,
                outbound,
                closed: AtomicBool::new(false),
                state: Mutex::new(ClientState::Lobby),
            }),
        }
    }

    /// The registration's unique id.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The session this handle was registered under.
    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Whether two handles refer to the same registration.
    pub fn same_as(&self, other: &ConnectionHandle) -> bool {
        self.inner.id == other.inner.id
    }

    /// Encodes and queues a message. Returns `false` if it was dropped.
    pub fn send(&self, msg: &ServerMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        let bytes = match JsonCodec.encode(msg) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(
                    conn_id = %self.id(),
                    kind = msg.kind(),
                    error = %e,
                    "dropping unencodable message"
                );
                return false;
            }
        };
        if self.inner.outbound.send(Outbound::Frame(bytes)).is_err() {
            tracing::debug!(conn_id = %self.id(), "writer gone, message dropped");
            return false;
        }
        true
    }

    /// Asks the writer to close the socket. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inner.outbound.send(Outbound::Close);
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current lifecycle state of the connection.
    pub fn client_state(&self) -> ClientState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves the connection to another lifecycle state.
    pub fn set_client_state(&self, state: ClientState) {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("session_id", &self.inner.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

/// Live connections keyed by session id. One lock guards the whole map.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<SessionId, ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a connection for `session_id`.
    ///
    /// Any handle previously registered under the same session is
    /// replaced and closed.
    pub fn register(
        &self,
        session_id: SessionId,
        outbound: OutboundSender,
    ) -> ConnectionHandle {
        let handle =
            ConnectionHandle::new(self.next_connection_id(), session_id.clone(), outbound);
        let previous = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id, handle.clone());

        if let Some(previous) = previous {
            tracing::info!(
                session_id = %handle.session_id(),
                old = %previous.id(),
                new = %handle.id(),
                "session rebound to a new connection"
            );
            previous.close();
        }
        handle
    }

    /// Moves a live connection to another session id.
    ///
    /// Used when a client proves (by reconnecting) that it owns a
    /// different session than the one it connected with. Returns the
    /// handle to use from now on; it keeps the same outbound queue and
    /// lifecycle state.
    pub fn rebind(&self, handle: &ConnectionHandle, session_id: SessionId) -> ConnectionHandle {
        if handle.session_id() == &session_id {
            return handle.clone();
        }
        let rebound = ConnectionHandle::new(
            self.next_connection_id(),
            session_id.clone(),
            handle.inner.outbound.clone(),
        );
        rebound.set_client_state(handle.client_state());

        let displaced = {
            let mut map = self
                .connections
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if map.get(handle.session_id()).is_some_and(|h| h.same_as(handle)) {
                map.remove(handle.session_id());
            }
            map.insert(session_id, rebound.clone())
        };
        if let Some(displaced) = displaced {
            displaced.close();
        }
        rebound
    }

    /// The connection currently registered for a session.
    pub fn lookup(&self, session_id: &SessionId) -> Option<ConnectionHandle> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Removes `handle` if it is still the registered one for its session.
    ///
    /// Returns `false` (and changes nothing) for a superseded handle.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut map = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !map.get(handle.session_id()).is_some_and(|h| h.same_as(handle)) {
            return false;
        }
        map.remove(handle.session_id());
        true
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether no session is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    use feast_protocol::{ErrorCode, ServerMessage};

    use super::*;

    fn sid(s: &str) -> SessionId {
        SessionId::new(s)
    }

    fn channel() -> (OutboundSender, OutboundReceiver) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.register(sid("a"), tx);

        let found = registry.lookup(&sid("a")).unwrap();
        assert!(found.same_as(&handle));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup(&sid("b")).is_none());
    }

    #[test]
    fn test_register_same_session_closes_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (tx1, mut rx1) = channel();
        let (tx2, _rx2) = channel();

        let first = registry.register(sid("a"), tx1);
        let second = registry.register(sid("a"), tx2);

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_ne!(first.id(), second.id());
        assert_eq!(rx1.try_recv().unwrap(), Outbound::Close);
        assert!(registry.lookup(&sid("a")).unwrap().same_as(&second));
    }

    #[test]
    fn test_unregister_stale_handle_is_noop() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();
        let old = registry.register(sid("a"), tx1);
        let new = registry.register(sid("a"), tx2);

        assert!(!registry.unregister(&old));
        assert!(registry.lookup(&sid("a")).unwrap().same_as(&new));

        assert!(registry.unregister(&new));
        assert!(registry.lookup(&sid("a")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_rebind_moves_connection_to_new_session() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let temp = registry.register(sid("temp"), tx);
        temp.set_client_state(ClientState::Waiting);

        let rebound = registry.rebind(&temp, sid("durable"));

        assert!(registry.lookup(&sid("temp")).is_none());
        assert!(registry.lookup(&sid("durable")).unwrap().same_as(&rebound));
        assert_eq!(rebound.client_state(), ClientState::Waiting);
        assert!(rebound.send(&ServerMessage::error(ErrorCode::Internal, "x")));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Frame(_)));
    }

    #[test]
    fn test_rebind_closes_displaced_connection() {
        let registry = ConnectionRegistry::new();
        let (tx_old, mut rx_old) = channel();
        let (tx_new, _rx_new) = channel();
        registry.register(sid("durable"), tx_old);
        let temp = registry.register(sid("temp"), tx_new);

        registry.rebind(&temp, sid("durable"));
        assert_eq!(rx_old.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_rebind_to_own_session_returns_same_handle() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.register(sid("a"), tx);
        let same = registry.rebind(&handle, sid("a"));
        assert!(same.same_as(&handle));
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_send_encodes_json_frame() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = channel();
        let handle = registry.register(sid("a"), tx);

        assert!(handle.send(&ServerMessage::error(ErrorCode::RoomFull, "full")));
        let Outbound::Frame(bytes) = rx.try_recv().unwrap() else {
            panic!("expected a frame");
        };
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.contains(r#""code":"room_full""#));
    }

    #[test]
    fn test_send_after_close_or_dropped_receiver_is_dropped() {
        let registry = ConnectionRegistry::new();
        let (tx, rx) = channel();
        let handle = registry.register(sid("a"), tx);
        drop(rx);
        assert!(!handle.send(&ServerMessage::error(ErrorCode::Internal, "x")));

        let (tx, _rx) = channel();
        let handle = registry.register(sid("b"), tx);
        handle.close();
        handle.close();
        assert!(!handle.send(&ServerMessage::error(ErrorCode::Internal, "x")));
    }

    #[test]
    fn test_client_state_defaults_to_lobby() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = channel();
        let handle = registry.register(sid("a"), tx);
        assert_eq!(handle.client_state(), ClientState::Lobby);
        handle.set_client_state(ClientState::InGame);
        assert_eq!(registry.lookup(&sid("a")).unwrap().client_state(), ClientState::InGame);
    }
}
