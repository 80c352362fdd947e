//! Wire protocol between sync clients and the room server.
//!
//! Every websocket frame is one binary message encoded with `bincode`.
//! Document payloads (`update`, `snapshot`) are opaque substrate exports and
//! are passed through the server untouched.

use grove_crdt::VersionVector;
use serde::{Deserialize, Serialize};

use crate::SyncError;

/// Rooms are addressed by name
pub type RoomId = String;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Enter a room. `version` is what the client already has (`None` asks
    /// for a full snapshot); `update` carries local ops the server may lack.
    Join {
        room: RoomId,
        version: Option<VersionVector>,
        update: Option<Vec<u8>>,
    },
    /// Local commits, acknowledged by `seq`
    Update {
        room: RoomId,
        seq: u64,
        update: Vec<u8>,
    },
    Leave {
        room: RoomId,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Reply to `Join`. `snapshot` is `None` exactly when `new_room` is set.
    Joined {
        room: RoomId,
        snapshot: Option<Vec<u8>>,
        new_room: bool,
        version: VersionVector,
    },
    /// Ops another member pushed
    Update { room: RoomId, update: Vec<u8> },
    Ack { room: RoomId, seq: u64 },
    Pong,
    Error {
        room: Option<RoomId>,
        message: String,
    },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, SyncError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn error(room: Option<&str>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            room: room.map(str::to_string),
            message: message.into(),
        }
    }
}
