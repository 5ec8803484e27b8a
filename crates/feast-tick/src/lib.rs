//! Timing primitives for turn-based rooms.
//!
//! Two tools, both built on `tokio::time` so tests can run them under
//! paused time:
//!
//! - [`TurnTimer`]: a single-flight countdown that ticks at a fixed
//!   period and fires a timeout exactly once.
//! - [`DeferredTasks`]: delayed callbacks grouped under a key (a room
//!   id, a seat) so a whole group can be cancelled when the room goes
//!   away.
//!
//! # Integration
//!
//! ```ignore
//! room_tasks.schedule(room_id.clone(), Duration::from_secs(2), async move {
//!     if !rooms.is_live(&room_id) {
//!         return;
//!     }
//!     room.advance_matching();
//! });
//! ```

mod deferred;
mod timer;

pub use deferred::{DeferredTasks, TaskId};
pub use timer::TurnTimer;
