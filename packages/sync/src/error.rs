use grove_crdt::CrdtError;
use grove_editor::EditorError;
use thiserror::Error;

use crate::RoomId;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    /// Reconnecting gave up, or the client was closed
    #[error("Connection lost")]
    ConnectionLost,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Room {room} rejected the request: {message}")]
    Rejected { room: RoomId, message: String },

    #[error(transparent)]
    Editor(#[from] EditorError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persisted room {room} is corrupt: {reason}")]
    Corrupt { room: RoomId, reason: String },
}
