//! Player identity and connection tracking for the Memory Feast server.
//!
//! This crate reconciles three lifetimes that must stay consistent:
//!
//! 1. **Connection**: a socket; may drop and reattach at any moment
//!    ([`ConnectionRegistry`], [`ConnectionHandle`])
//! 2. **Player**: a durable identity bound to a session id, outliving
//!    its connections ([`Player`])
//! 3. **Session record**: where a session was last seated, kept in a
//!    [`SessionStore`] so a returning client can be put back
//!
//! # How it fits in the stack
//!
//! ```text
//! Room Layer (above)  ← seats players, fans out through the registry
//!     ↕
//! Session Layer (this crate)  ← who is connected, who is who
//!     ↕
//! Protocol Layer (below)  ← SessionId, ServerMessage, ClientState
//! ```

#![allow(async_fn_in_trait)]

mod error;
mod player;
mod registry;
mod store;

pub use error::StoreError;
pub use player::Player;
pub use registry::{
    ConnectionHandle, ConnectionRegistry, Outbound, OutboundReceiver, OutboundSender,
};
pub use store::{
    MemoryStore, PlateData, PlayerData, RoomData, SessionRecord, SessionStore, StateData,
    StoreConfig,
};
