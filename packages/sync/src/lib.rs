//! # Grove Sync
//!
//! Shares grove documents between processes. A room is one named document;
//! the server keeps it in memory while anyone is connected, merges and
//! forwards every member's ops, and saves a snapshot per room on a timer.
//!
//! ```text
//!  SyncClient ──ws──┐                 ┌── Persistence (file / memory)
//!  SyncClient ──ws──┼──▶ RoomServer ──┤
//!  SyncClient ──ws──┘   (one task)    └── Room ▸ Document
//! ```
//!
//! Frames are `bincode`-encoded [`ClientMessage`] / [`ServerMessage`]
//! values; document payloads inside them are opaque substrate exports.

pub mod client;
pub mod config;
pub mod error;
pub mod persistence;
pub mod protocol;
pub mod room;
pub mod server;

pub use client::{ConnectionStatus, RoomHandle, SyncClient};
pub use config::{ClientConfig, ServerConfig};
pub use error::{PersistenceError, SyncError};
pub use persistence::{FilePersistence, MemoryPersistence, Persistence};
pub use protocol::{ClientMessage, RoomId, ServerMessage};
pub use room::{ClientId, RoomInfo, RoomStatus};
pub use server::{router, spawn_server, ServerHandle};
