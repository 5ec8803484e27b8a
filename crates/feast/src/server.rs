//! `FeastServer` builder and server loop.
//!
//! This is the entry point for running a Memory Feast server. It ties
//! together all the layers: transport → protocol → session → room.

use std::sync::{Arc, Weak};

use feast_protocol::{ClientState, JsonCodec, QueueTimeoutPayload, RoomId, ServerMessage};
use feast_room::{
    MatchHandler, Matchmaker, QueueEntry, Room, RoomError, RoomEvent, RoomManager,
};
use feast_session::{ConnectionRegistry, SessionStore};
use feast_tick::DeferredTasks;
use feast_transport::{OriginPolicy, Transport, TransportError, WebSocketTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::flow;
use crate::handler::handle_connection;
use crate::{FeastError, ServerConfig};

/// Shared server state passed to each connection handler task.
///
/// Wrapped in `Arc` so it can be cheaply cloned across tasks. Every
/// registry inside locks internally; nothing here is held across an
/// await.
pub(crate) struct ServerState<S: SessionStore> {
    pub(crate) config: ServerConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) rooms: Arc<RoomManager>,
    pub(crate) matchmaker: Arc<Matchmaker>,
    pub(crate) store: Arc<S>,
    /// Reveal and turn-pass choreography, keyed by room.
    pub(crate) room_tasks: DeferredTasks<RoomId>,
    /// Pending forfeits, keyed by seat.
    pub(crate) forfeits: DeferredTasks<(RoomId, usize)>,
    pub(crate) codec: JsonCodec,
}

impl<S: SessionStore> ServerState<S> {
    /// Whether `room` is still the indexed, unfinished room for its id.
    ///
    /// Deferred callbacks check this before touching the room, so a
    /// callback that outlived its room is a no-op.
    pub(crate) fn is_live(&self, room: &Arc<Room>) -> bool {
        self.rooms
            .get(room.id())
            .is_some_and(|indexed| Arc::ptr_eq(&indexed, room) && !indexed.is_finished())
    }
}

/// Seats matchmaker pairs in fresh rooms and tells timed-out players.
struct ServerPairing {
    rooms: Arc<RoomManager>,
    registry: Arc<ConnectionRegistry>,
    timeout_secs: u64,
}

impl MatchHandler for ServerPairing {
    fn pair(
        &self,
        first: &QueueEntry,
        second: &QueueEntry,
        plate_count: usize,
    ) -> Result<Arc<Room>, RoomError> {
        let room = self.rooms.create_room(plate_count)?;
        let seated = room
            .add_player(Arc::clone(&first.player))
            .and_then(|_| room.add_player(Arc::clone(&second.player)));
        if let Err(e) = seated {
            self.rooms.remove(room.id());
            return Err(e);
        }
        Ok(room)
    }

    fn on_timeout(&self, entry: &QueueEntry) {
        let Some(conn) = self.registry.lookup(entry.player.session_id()) else {
            return;
        };
        if conn.client_state() != ClientState::Waiting {
            return;
        }
        conn.set_client_state(ClientState::Lobby);
        conn.send(&ServerMessage::QueueTimeout(QueueTimeoutPayload {
            timeout_seconds: self.timeout_secs,
        }));
    }
}

/// Builder for configuring and starting a Memory Feast server.
///
/// # Example
///
/// ```rust,ignore
/// use feast::prelude::*;
///
/// let server = FeastServer::builder()
///     .bind("0.0.0.0:8080")
///     .build(Arc::new(MemoryStore::default()))
///     .await?;
/// server.run().await
/// ```
pub struct FeastServerBuilder {
    config: ServerConfig,
}

impl FeastServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind_addr = addr.to_string();
        self
    }

    /// Replaces the whole configuration, including its bind address.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Binds the listener and wires up the registries.
    ///
    /// Must be called inside a Tokio runtime: the queue sweeper and the
    /// room event loop are spawned here.
    pub async fn build<S: SessionStore>(
        self,
        store: Arc<S>,
    ) -> Result<FeastServer<S>, FeastError> {
        let config = self.config;
        let transport = WebSocketTransport::bind(&config.bind_addr)
            .await?
            .with_origin_policy(OriginPolicy::new(&config.allowed_origins));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ConnectionRegistry::new());
        let rooms = Arc::new(RoomManager::new(
            config.room.clone(),
            Arc::clone(&registry),
            Some(events_tx),
        ));
        let pairing = Arc::new(ServerPairing {
            rooms: Arc::clone(&rooms),
            registry: Arc::clone(&registry),
            timeout_secs: config.queue.timeout.as_secs(),
        });
        let matchmaker = Arc::new(Matchmaker::new(config.queue.clone(), pairing));
        let sweeper = matchmaker.spawn_sweeper();

        let state = Arc::new(ServerState {
            config,
            registry,
            rooms,
            matchmaker,
            store,
            room_tasks: DeferredTasks::new(),
            forfeits: DeferredTasks::new(),
            codec: JsonCodec,
        });
        let events = tokio::spawn(room_event_loop(Arc::downgrade(&state), events_rx));

        Ok(FeastServer {
            transport,
            state,
            background: vec![sweeper, events],
        })
    }
}

impl Default for FeastServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Tears down rooms that report themselves empty.
async fn room_event_loop<S: SessionStore>(
    state: Weak<ServerState<S>>,
    mut events: mpsc::UnboundedReceiver<RoomEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        match event {
            RoomEvent::Empty(room_id) => {
                // Someone may have taken a seat since the event was sent.
                let still_empty = state
                    .rooms
                    .get(&room_id)
                    .is_some_and(|room| room.player_count() == 0);
                if still_empty {
                    flow::teardown(&state, &room_id).await;
                }
            }
        }
    }
    tracing::debug!("room event loop stopped");
}

/// A running Memory Feast server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct FeastServer<S: SessionStore> {
    transport: WebSocketTransport,
    state: Arc<ServerState<S>>,
    background: Vec<JoinHandle<()>>,
}

impl<S: SessionStore> FeastServer<S> {
    /// Creates a new builder.
    pub fn builder() -> FeastServerBuilder {
        FeastServerBuilder::new()
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Runs the server accept loop.
    ///
    /// Accepts incoming connections and spawns a handler task for each.
    /// Runs until the process is terminated.
    pub async fn run(mut self) -> Result<(), FeastError> {
        tracing::info!(addr = %self.state.config.bind_addr, "Memory Feast server running");

        loop {
            match self.transport.accept().await {
                Ok(conn) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(conn, state).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    });
                }
                Err(TransportError::OriginRejected(origin)) => {
                    tracing::warn!(%origin, "upgrade refused for origin");
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}

impl<S: SessionStore> Drop for FeastServer<S> {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}
