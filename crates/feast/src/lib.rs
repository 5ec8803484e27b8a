//! # Memory Feast
//!
//! Server for a two-player memory and bluffing game played over
//! WebSockets.
//!
//! Players place tokens on plates in turn, the plates are covered, and
//! then each turn a player picks two plates hoping their token counts
//! match. A match lets them shed a token; a miss or a timeout costs
//! tokens. The first player to run out wins.
//!
//! This crate is the orchestrator: it owns the registries, routes every
//! client message to the right room, and runs the delayed choreography
//! between actions (reveals, turn passes, forfeits).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use feast::prelude::*;
//!
//! # async fn run() -> Result<(), FeastError> {
//! let server = FeastServer::<MemoryStore>::builder()
//!     .bind("0.0.0.0:8080")
//!     .build(Arc::new(MemoryStore::default()))
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
mod error;
mod flow;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::FeastError;
pub use server::{FeastServer, FeastServerBuilder};

pub mod prelude {
    //! Everything needed to configure and run a server.

    pub use crate::{FeastError, FeastServer, FeastServerBuilder, ServerConfig};
    pub use feast_protocol::{
        ClientMessage, EndReason, ErrorCode, MessageType, Phase, ServerMessage, SessionId,
    };
    pub use feast_room::{QueueConfig, RoomConfig};
    pub use feast_session::{MemoryStore, SessionStore, StoreConfig};
}
