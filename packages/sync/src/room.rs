//! # Room state machine
//!
//! ```text
//! UNLOADED ──join──▶ LOADING ──loaded──▶ ACTIVE ──all members gone, saved──▶ evicted
//!                       │                  │  ▲
//!                       │ load failed      └──┘ save tick (SAVED / SAVE FAILED)
//!                       ▼
//!                 joiners get Error
//! ```
//!
//! `UNLOADED` is simply "not in the registry". Joins that arrive while a room
//! is loading queue up and are answered in order once the document exists, so
//! nobody ever sees a half-loaded room.

use std::collections::HashMap;

use grove_crdt::VersionVector;
use grove_editor::Document;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{RoomId, ServerMessage};

pub type ClientId = u64;

/// Outbound queue of one connection
pub(crate) type Outbox = mpsc::UnboundedSender<ServerMessage>;

pub(crate) struct JoinRequest {
    pub client: ClientId,
    pub outbox: Outbox,
    pub version: Option<VersionVector>,
    pub update: Option<Vec<u8>>,
    /// `(seq, update)` pushed while the room was still loading
    pub queued: Vec<(u64, Vec<u8>)>,
}

enum RoomState {
    Loading { waiting: Vec<JoinRequest> },
    Active { doc: Document, created: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Loading,
    Active,
    /// No members left; waiting for the final save
    Closing,
}

/// Registry view of one room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomInfo {
    pub id: RoomId,
    pub status: RoomStatus,
    pub members: usize,
    pub dirty: bool,
}

pub(crate) struct Room {
    id: RoomId,
    state: RoomState,
    members: HashMap<ClientId, Outbox>,
    /// Changed since the last successful save
    dirty: bool,
    saving: bool,
}

impl Room {
    pub fn loading(id: RoomId, first: JoinRequest) -> Self {
        Self {
            id,
            state: RoomState::Loading {
                waiting: vec![first],
            },
            members: HashMap::new(),
            dirty: false,
            saving: false,
        }
    }

    pub fn info(&self) -> RoomInfo {
        let status = match self.state {
            RoomState::Loading { .. } => RoomStatus::Loading,
            RoomState::Active { .. } if self.members.is_empty() => RoomStatus::Closing,
            RoomState::Active { .. } => RoomStatus::Active,
        };
        RoomInfo {
            id: self.id.clone(),
            status,
            members: self.members.len(),
            dirty: self.dirty,
        }
    }

    /// Persisted bytes arrived. On error the room is unusable; the caller
    /// drops it and reports the failure to everyone waiting.
    pub fn loaded(&mut self, bytes: Option<Vec<u8>>) -> Result<(), String> {
        let mut doc = Document::new();
        let created = match bytes {
            None => {
                info!(room = %self.id, "NEW");
                true
            }
            Some(bytes) => {
                doc.import(&bytes).map_err(|e| e.to_string())?;
                info!(room = %self.id, bytes = bytes.len(), "LOAD");
                false
            }
        };

        let waiting = match std::mem::replace(&mut self.state, RoomState::Active { doc, created }) {
            RoomState::Loading { waiting } => waiting,
            RoomState::Active { .. } => Vec::new(),
        };
        for request in waiting {
            self.join(request);
        }
        Ok(())
    }

    /// Reject every queued joiner
    pub fn fail(self, reason: &str) {
        if let RoomState::Loading { waiting } = self.state {
            for request in waiting {
                let message = format!("failed to load room: {}", reason);
                let _ = request
                    .outbox
                    .send(ServerMessage::error(Some(&self.id), message));
            }
        }
    }

    pub fn join(&mut self, request: JoinRequest) {
        let (doc, created) = match &mut self.state {
            RoomState::Loading { waiting } => {
                debug!(room = %self.id, client = request.client, "join queued behind load");
                waiting.push(request);
                return;
            }
            RoomState::Active { doc, created } => (doc, *created),
        };

        if let Some(update) = &request.update {
            match doc.import(update) {
                Ok(status) if status.applied > 0 => {
                    info!(room = %self.id, bytes = update.len(), "SYNC");
                    self.dirty = true;
                    broadcast(&self.members, request.client, &self.id, update);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        room = %self.id,
                        client = request.client,
                        error = %err,
                        "rejected join update"
                    );
                    let _ = request
                        .outbox
                        .send(ServerMessage::error(Some(&self.id), err.to_string()));
                    return;
                }
            }
        }

        let new_room = created && doc.version().is_empty();
        let snapshot = if new_room {
            None
        } else {
            let exported = match &request.version {
                Some(version) => doc.export_updates(version),
                None => doc.export_snapshot(),
            };
            match exported {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    error!(room = %self.id, error = %err, "failed to export room state");
                    let _ = request
                        .outbox
                        .send(ServerMessage::error(Some(&self.id), err.to_string()));
                    return;
                }
            }
        };

        let joined = ServerMessage::Joined {
            room: self.id.clone(),
            snapshot,
            new_room,
            version: doc.version().clone(),
        };
        let JoinRequest {
            client,
            outbox,
            queued,
            ..
        } = request;
        if outbox.send(joined).is_err() {
            return;
        }
        debug!(room = %self.id, client, "joined");
        self.members.insert(client, outbox.clone());
        for (seq, update) in queued {
            self.update(client, &outbox, seq, update);
        }
    }

    /// Merge a member's update, forward it to everyone else and acknowledge it
    pub fn update(&mut self, client: ClientId, outbox: &Outbox, seq: u64, update: Vec<u8>) {
        let doc = match &mut self.state {
            RoomState::Active { doc, .. } => doc,
            RoomState::Loading { waiting } => {
                match waiting.iter_mut().find(|request| request.client == client) {
                    Some(request) => request.queued.push((seq, update)),
                    None => {
                        let _ = outbox.send(ServerMessage::error(
                            Some(&self.id),
                            "not a member of this room",
                        ));
                    }
                }
                return;
            }
        };
        if !self.members.contains_key(&client) {
            let _ = outbox.send(ServerMessage::error(Some(&self.id), "not a member of this room"));
            return;
        }

        match doc.import(&update) {
            Ok(status) => {
                if status.applied > 0 {
                    info!(room = %self.id, bytes = update.len(), "SYNC");
                    self.dirty = true;
                    broadcast(&self.members, client, &self.id, &update);
                }
                let _ = outbox.send(ServerMessage::Ack {
                    room: self.id.clone(),
                    seq,
                });
            }
            Err(err) => {
                warn!(room = %self.id, client, error = %err, "rejected update");
                let _ = outbox.send(ServerMessage::error(Some(&self.id), err.to_string()));
            }
        }
    }

    /// Returns whether `client` was a member or a queued joiner
    pub fn leave(&mut self, client: ClientId) -> bool {
        let mut removed = self.members.remove(&client).is_some();
        if let RoomState::Loading { waiting } = &mut self.state {
            let before = waiting.len();
            waiting.retain(|request| request.client != client);
            removed |= waiting.len() != before;
        }
        removed
    }

    /// Snapshot to persist, if the room changed and no save is running
    pub fn begin_save(&mut self) -> Option<Vec<u8>> {
        let RoomState::Active { doc, .. } = &self.state else {
            return None;
        };
        if !self.dirty || self.saving {
            return None;
        }
        match doc.export_snapshot() {
            Ok(bytes) => {
                self.dirty = false;
                self.saving = true;
                Some(bytes)
            }
            Err(err) => {
                error!(room = %self.id, error = %err, "failed to export snapshot");
                None
            }
        }
    }

    pub fn finish_save(&mut self, result: Result<usize, String>) {
        self.saving = false;
        match result {
            Ok(bytes) => info!(room = %self.id, bytes, "SAVED"),
            Err(reason) => {
                error!(room = %self.id, error = %reason, "SAVE FAILED");
                // retried on the next tick
                self.dirty = true;
            }
        }
    }

    pub fn is_saving(&self) -> bool {
        self.saving
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, RoomState::Loading { .. })
    }

    pub fn is_empty(&self) -> bool {
        match &self.state {
            RoomState::Loading { waiting } => waiting.is_empty(),
            RoomState::Active { .. } => self.members.is_empty(),
        }
    }

    /// Nobody is left and everything is on disk
    pub fn can_evict(&self) -> bool {
        !self.is_loading() && self.members.is_empty() && !self.dirty && !self.saving
    }
}

fn broadcast(members: &HashMap<ClientId, Outbox>, origin: ClientId, room: &str, update: &[u8]) {
    for (client, outbox) in members {
        if *client == origin {
            continue;
        }
        let _ = outbox.send(ServerMessage::Update {
            room: room.to_string(),
            update: update.to_vec(),
        });
    }
}
