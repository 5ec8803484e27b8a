//! FIFO matchmaking queue.
//!
//! The queue only decides *who* plays whom. Building the room and telling
//! the clients is left to the injected [`MatchHandler`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use feast_protocol::SessionId;
use feast_session::{ConnectionHandle, Player};
use feast_transport::ConnectionId;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::config::clamp_plate_count;
use crate::{QueueConfig, Room, RoomError};

/// A player waiting for an opponent.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub player: Arc<Player>,
    /// The connection that queued, if any.
    pub connection: Option<ConnectionHandle>,
    pub joined_at: Instant,
    pub plate_count: usize,
}

/// Receives the matchmaker's decisions.
pub trait MatchHandler: Send + Sync + 'static {
    /// Seats `first` in slot 0 and `second` in slot 1 of a new room.
    fn pair(
        &self,
        first: &QueueEntry,
        second: &QueueEntry,
        plate_count: usize,
    ) -> Result<Arc<Room>, RoomError>;

    /// Called once for each entry evicted by the timeout sweep.
    fn on_timeout(&self, _entry: &QueueEntry) {}
}

/// What happened to a `join_queue` call.
#[derive(Debug)]
pub enum JoinOutcome {
    /// Waiting, at this 1-indexed position.
    Queued { position: usize },
    /// Paired immediately with the head of the queue.
    Matched { room: Arc<Room> },
}

impl JoinOutcome {
    /// Queue position, or 0 once matched.
    pub fn position(&self) -> usize {
        match self {
            JoinOutcome::Queued { position } => *position,
            JoinOutcome::Matched { .. } => 0,
        }
    }
}

/// The waiting line.
pub struct Matchmaker {
    config: QueueConfig,
    handler: Arc<dyn MatchHandler>,
    queue: Mutex<VecDeque<QueueEntry>>,
}

impl Matchmaker {
    pub fn new(config: QueueConfig, handler: Arc<dyn MatchHandler>) -> Self {
        Self {
            config,
            handler,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queues a player, or pairs them with whoever has waited longest.
    ///
    /// A session already in the queue keeps its place; only its player and
    /// connection are refreshed.
    pub fn join_queue(
        &self,
        player: Arc<Player>,
        connection: Option<ConnectionHandle>,
        plate_count: i64,
    ) -> Result<JoinOutcome, RoomError> {
        let plate_count = clamp_plate_count(plate_count);
        let mut queue = self.lock();

        if let Some(pos) = queue
            .iter()
            .position(|e| e.player.session_id() == player.session_id())
        {
            let entry = &mut queue[pos];
            entry.player = player;
            entry.connection = connection;
            entry.plate_count = plate_count;
            debug!(
                session_id = %entry.player.session_id(),
                position = pos + 1,
                "queue entry refreshed"
            );
            return Ok(JoinOutcome::Queued { position: pos + 1 });
        }

        let entry = QueueEntry {
            player,
            connection,
            joined_at: Instant::now(),
            plate_count,
        };

        let Some(head) = queue.pop_front() else {
            info!(session_id = %entry.player.session_id(), "player queued");
            queue.push_back(entry);
            return Ok(JoinOutcome::Queued { position: 1 });
        };

        let agreed = clamp_plate_count(((head.plate_count + entry.plate_count) / 2) as i64);
        match self.handler.pair(&head, &entry, agreed) {
            Ok(room) => {
                info!(
                    room_id = %room.id(),
                    first = %head.player.session_id(),
                    second = %entry.player.session_id(),
                    "players paired"
                );
                Ok(JoinOutcome::Matched { room })
            }
            Err(e) => {
                queue.push_front(head);
                Err(e)
            }
        }
    }

    /// Removes a session from the queue.
    pub fn leave_queue(&self, session_id: &SessionId) -> bool {
        let mut queue = self.lock();
        let before = queue.len();
        queue.retain(|e| e.player.session_id() != session_id);
        before != queue.len()
    }

    /// Removes a session only if it was queued by `connection`. A newer
    /// connection that re-queued the same session is left alone.
    pub fn leave_queue_if(&self, session_id: &SessionId, connection: ConnectionId) -> bool {
        let mut queue = self.lock();
        let before = queue.len();
        queue.retain(|e| {
            e.player.session_id() != session_id
                || e.connection.as_ref().map(ConnectionHandle::id) != Some(connection)
        });
        before != queue.len()
    }

    /// Evicts entries older than the queue timeout and reports each to the
    /// handler. Returns how many were evicted.
    pub fn cleanup_timed_out(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.timeout;
        let expired = {
            let mut queue = self.lock();
            let (expired, kept): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .partition(|e| now.duration_since(e.joined_at) >= timeout);
            *queue = kept;
            expired
        };

        for entry in &expired {
            info!(session_id = %entry.player.session_id(), "queue entry timed out");
            self.handler.on_timeout(entry);
        }
        expired.len()
    }

    /// Runs [`cleanup_timed_out`](Self::cleanup_timed_out) every sweep
    /// interval until the matchmaker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(matchmaker) = weak.upgrade() else {
                    break;
                };
                matchmaker.cleanup_timed_out();
            }
        })
    }

    pub fn queue_len(&self) -> usize {
        self.lock().len()
    }

    /// 1-indexed position of a session, if queued.
    pub fn position(&self, session_id: &SessionId) -> Option<usize> {
        self.lock()
            .iter()
            .position(|e| e.player.session_id() == session_id)
            .map(|i| i + 1)
    }
}
