//! Room server: a single task owns the room registry; connections and
//! persistence tasks talk to it through a command channel.
//!
//! Loads and saves run as spawned tasks and report back with
//! `Command::Loaded` / `Command::Saved`, so slow storage never stalls other
//! rooms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::persistence::Persistence;
use crate::room::{ClientId, JoinRequest, Outbox, Room, RoomInfo};
use crate::{ClientMessage, PersistenceError, RoomId, ServerMessage};

enum Command {
    Register {
        client: ClientId,
        outbox: Outbox,
    },
    Message {
        client: ClientId,
        message: ClientMessage,
    },
    Disconnected {
        client: ClientId,
    },
    Loaded {
        room: RoomId,
        result: Result<Option<Vec<u8>>, PersistenceError>,
    },
    Saved {
        room: RoomId,
        result: Result<usize, PersistenceError>,
    },
    Rooms {
        reply: oneshot::Sender<Vec<RoomInfo>>,
    },
    Flush {
        reply: oneshot::Sender<()>,
        stop: bool,
    },
}

/// Cloneable handle to a running room server
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_client: Arc<AtomicU64>,
}

impl ServerHandle {
    /// Register a connection. Messages for it arrive on the returned receiver.
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let client = self.next_client.fetch_add(1, Ordering::Relaxed);
        let (outbox, inbox) = mpsc::unbounded_channel();
        let _ = self.commands.send(Command::Register { client, outbox });
        (client, inbox)
    }

    pub fn send(&self, client: ClientId, message: ClientMessage) {
        let _ = self.commands.send(Command::Message { client, message });
    }

    pub fn disconnect(&self, client: ClientId) {
        let _ = self.commands.send(Command::Disconnected { client });
    }

    pub async fn rooms(&self) -> Vec<RoomInfo> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Rooms { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Save every changed room and wait for the saves to finish
    pub async fn flush(&self) {
        self.request_flush(false).await
    }

    /// Final flush, then stop the server task
    pub async fn shutdown(&self) {
        self.request_flush(true).await
    }

    async fn request_flush(&self, stop: bool) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Flush { reply, stop }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Start the room server task
pub fn spawn_server<P: Persistence>(persistence: P, save_interval: Duration) -> ServerHandle {
    let (commands, inbox) = mpsc::unbounded_channel();
    let server = RoomServer {
        persistence: Arc::new(persistence),
        rooms: HashMap::new(),
        clients: HashMap::new(),
        commands: commands.clone(),
        flush_waiters: Vec::new(),
        stopping: false,
    };
    tokio::spawn(server.run(inbox, save_interval));
    ServerHandle {
        commands,
        next_client: Arc::new(AtomicU64::new(1)),
    }
}

struct RoomServer<P> {
    persistence: Arc<P>,
    rooms: HashMap<RoomId, Room>,
    clients: HashMap<ClientId, Outbox>,
    /// For spawned load/save tasks to report back
    commands: mpsc::UnboundedSender<Command>,
    flush_waiters: Vec<oneshot::Sender<()>>,
    stopping: bool,
}

impl<P: Persistence> RoomServer<P> {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>, save_interval: Duration) {
        let mut ticker = tokio::time::interval(save_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                command = inbox.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command);
                    if self.stopping && self.flush_waiters.is_empty() {
                        break;
                    }
                }
                _ = ticker.tick() => self.save_changed_rooms(),
            }
        }
        info!(rooms = self.rooms.len(), "room server stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Register { client, outbox } => {
                self.clients.insert(client, outbox);
            }
            Command::Message { client, message } => self.on_message(client, message),
            Command::Disconnected { client } => {
                self.clients.remove(&client);
                let rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
                for room in rooms {
                    self.leave(&room, client);
                }
            }
            Command::Loaded { room, result } => self.on_loaded(room, result),
            Command::Saved { room, result } => self.on_saved(room, result),
            Command::Rooms { reply } => {
                let mut rooms: Vec<RoomInfo> = self.rooms.values().map(Room::info).collect();
                rooms.sort_by(|a, b| a.id.cmp(&b.id));
                let _ = reply.send(rooms);
            }
            Command::Flush { reply, stop } => {
                self.stopping |= stop;
                self.flush_waiters.push(reply);
                self.save_changed_rooms();
                self.notify_flushed();
            }
        }
    }

    fn on_message(&mut self, client: ClientId, message: ClientMessage) {
        let Some(outbox) = self.clients.get(&client).cloned() else {
            debug!(client, "message from unregistered client");
            return;
        };
        match message {
            ClientMessage::Join {
                room,
                version,
                update,
            } => {
                let request = JoinRequest {
                    client,
                    outbox,
                    version,
                    update,
                    queued: Vec::new(),
                };
                match self.rooms.get_mut(&room) {
                    Some(existing) => existing.join(request),
                    None => {
                        self.rooms
                            .insert(room.clone(), Room::loading(room.clone(), request));
                        self.spawn_load(room);
                    }
                }
            }
            ClientMessage::Update { room, seq, update } => match self.rooms.get_mut(&room) {
                Some(existing) => existing.update(client, &outbox, seq, update),
                None => {
                    let _ = outbox
                        .send(ServerMessage::error(Some(&room), "not a member of this room"));
                }
            },
            ClientMessage::Leave { room } => self.leave(&room, client),
            ClientMessage::Ping => {
                let _ = outbox.send(ServerMessage::Pong);
            }
        }
    }

    fn leave(&mut self, room: &str, client: ClientId) {
        let Some(existing) = self.rooms.get_mut(room) else {
            return;
        };
        if !existing.leave(client) {
            return;
        }
        debug!(room, client, "left");
        if existing.is_empty() && !existing.is_loading() {
            // final save before eviction
            self.save_room(room);
            self.evict_if_idle(room);
        }
    }

    fn spawn_load(&self, room: RoomId) {
        let persistence = Arc::clone(&self.persistence);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = persistence.load(&room).await;
            let _ = commands.send(Command::Loaded { room, result });
        });
    }

    fn on_loaded(&mut self, room: RoomId, result: Result<Option<Vec<u8>>, PersistenceError>) {
        let Some(mut existing) = self.rooms.remove(&room) else {
            return;
        };
        let outcome = result
            .map_err(|e| e.to_string())
            .and_then(|bytes| existing.loaded(bytes));
        match outcome {
            Ok(()) => {
                // every joiner may have disconnected during the load
                let idle = existing.can_evict();
                self.rooms.insert(room.clone(), existing);
                if idle {
                    self.evict_if_idle(&room);
                }
            }
            Err(reason) => {
                error!(room = %room, error = %reason, "failed to load room");
                existing.fail(&reason);
            }
        }
    }

    fn save_changed_rooms(&mut self) {
        let rooms: Vec<RoomId> = self.rooms.keys().cloned().collect();
        for room in rooms {
            self.save_room(&room);
        }
    }

    fn save_room(&mut self, room: &str) {
        let Some(bytes) = self.rooms.get_mut(room).and_then(Room::begin_save) else {
            return;
        };
        let persistence = Arc::clone(&self.persistence);
        let commands = self.commands.clone();
        let room = room.to_string();
        tokio::spawn(async move {
            let result = persistence.save(&room, &bytes).await.map(|()| bytes.len());
            let _ = commands.send(Command::Saved { room, result });
        });
    }

    fn on_saved(&mut self, room: RoomId, result: Result<usize, PersistenceError>) {
        if let Some(existing) = self.rooms.get_mut(&room) {
            // a failed save leaves the room dirty for the next tick
            existing.finish_save(result.map_err(|e| e.to_string()));
            self.evict_if_idle(&room);
        }
        self.notify_flushed();
    }

    fn evict_if_idle(&mut self, room: &str) {
        if self.rooms.get(room).is_some_and(Room::can_evict) {
            self.rooms.remove(room);
            info!(room, "EVICT");
        }
    }

    /// Answer flush requests once no save is in flight
    fn notify_flushed(&mut self) {
        if self.rooms.values().any(Room::is_saving) {
            return;
        }
        for waiter in self.flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// Websocket routes for a running server
pub fn router(server: ServerHandle) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(server)
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<ServerHandle>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: ServerHandle) {
    let (client, mut outbound) = server.register();
    let (mut ws_tx, mut ws_rx) = socket.split();
    debug!(client, "connection opened");

    // Spawn task to forward server messages to this websocket
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    error!(client, error = %err, "failed to encode message");
                    continue;
                }
            };
            if ws_tx.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
    });

    let receiver = server.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Binary(bytes)) => match ClientMessage::decode(&bytes) {
                    Ok(message) => receiver.send(client, message),
                    Err(err) => warn!(client, error = %err, "dropping undecodable frame"),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    server.disconnect(client);
    debug!(client, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use grove_editor::{Document, ReadDocument};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    const LONG: Duration = Duration::from_secs(3600);

    fn join(room: &str) -> ClientMessage {
        ClientMessage::Join {
            room: room.to_string(),
            version: None,
            update: None,
        }
    }

    async fn joined(
        inbox: &mut mpsc::UnboundedReceiver<ServerMessage>,
    ) -> (Option<Vec<u8>>, bool) {
        match inbox.recv().await {
            Some(ServerMessage::Joined {
                snapshot, new_room, ..
            }) => (snapshot, new_room),
            other => panic!("expected Joined, got {:?}", other),
        }
    }

    fn edit() -> Vec<u8> {
        let mut doc = Document::with_peer(42);
        doc.change(|tx| tx.create_root_node("section")).unwrap();
        doc.export_snapshot().unwrap()
    }

    /// Blocks every load until released, counting calls
    #[derive(Default)]
    struct GatedPersistence {
        loads: AtomicUsize,
        gate: Notify,
        fail: bool,
    }

    impl Persistence for GatedPersistence {
        async fn load(&self, _room: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            if self.fail {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into());
            }
            Ok(None)
        }

        async fn save(&self, _room: &str, _bytes: &[u8]) -> Result<(), PersistenceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_joins_share_one_load() {
        let store = Arc::new(GatedPersistence::default());
        let server = spawn_server(Arc::clone(&store), LONG);
        let (a, mut a_inbox) = server.register();
        let (b, mut b_inbox) = server.register();
        server.send(a, join("r"));
        server.send(b, join("r"));

        let rooms = server.rooms().await;
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].status, crate::RoomStatus::Loading);

        store.gate.notify_one();
        assert_eq!(joined(&mut a_inbox).await, (None, true));
        assert_eq!(joined(&mut b_inbox).await, (None, true));
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_load_failure_reaches_every_joiner() {
        let store = Arc::new(GatedPersistence {
            fail: true,
            ..Default::default()
        });
        let server = spawn_server(Arc::clone(&store), LONG);
        let (a, mut a_inbox) = server.register();
        let (b, mut b_inbox) = server.register();
        server.send(a, join("r"));
        server.send(b, join("r"));
        server.rooms().await;
        store.gate.notify_one();

        for inbox in [&mut a_inbox, &mut b_inbox] {
            assert!(matches!(inbox.recv().await, Some(ServerMessage::Error { .. })));
        }
        assert!(server.rooms().await.is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_retried() {
        let store = Arc::new(MemoryPersistence::new());
        let server = spawn_server(Arc::clone(&store), LONG);
        let (a, mut inbox) = server.register();
        server.send(a, join("r"));
        joined(&mut inbox).await;

        server.send(
            a,
            ClientMessage::Update {
                room: "r".to_string(),
                seq: 1,
                update: edit(),
            },
        );
        assert!(matches!(inbox.recv().await, Some(ServerMessage::Ack { seq: 1, .. })));

        store.fail_next_saves(1);
        server.flush().await;
        assert!(store.get("r").is_none());
        assert!(server.rooms().await[0].dirty);

        server.flush().await;
        let saved = Document::from_snapshot(1, &store.get("r").unwrap()).unwrap();
        assert!(saved.root().is_some());
    }

    /// Every save fails, counting attempts
    #[derive(Default)]
    struct BrokenDisk {
        saves: AtomicUsize,
    }

    impl Persistence for BrokenDisk {
        async fn load(&self, _room: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
            Ok(None)
        }

        async fn save(&self, _room: &str, _bytes: &[u8]) -> Result<(), PersistenceError> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            Err(std::io::Error::new(std::io::ErrorKind::Other, "read-only disk").into())
        }
    }

    #[tokio::test]
    async fn test_failing_save_of_empty_room_waits_for_next_tick() {
        let store = Arc::new(BrokenDisk::default());
        let server = spawn_server(Arc::clone(&store), Duration::from_millis(100));
        let (a, mut inbox) = server.register();
        server.send(
            a,
            ClientMessage::Join {
                room: "r".to_string(),
                version: None,
                update: Some(edit()),
            },
        );
        joined(&mut inbox).await;
        server.disconnect(a);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let attempts = store.saves.load(Ordering::SeqCst);
        // the leave save plus at most one retry per tick
        assert!((1..=5).contains(&attempts), "{} save attempts", attempts);

        // never evicted while its changes are only in memory
        let rooms = server.rooms().await;
        assert_eq!(rooms.len(), 1);
        assert!(rooms[0].dirty);
    }

    #[tokio::test]
    async fn test_room_evicted_after_final_save() {
        let store = Arc::new(MemoryPersistence::new());
        let server = spawn_server(Arc::clone(&store), LONG);
        let (a, mut inbox) = server.register();
        server.send(
            a,
            ClientMessage::Join {
                room: "r".to_string(),
                version: None,
                update: Some(edit()),
            },
        );
        joined(&mut inbox).await;
        server.disconnect(a);
        server.flush().await;

        assert!(server.rooms().await.is_empty());
        assert!(store.get("r").is_some());

        // loaded back from storage on the next join
        let (b, mut inbox) = server.register();
        server.send(b, join("r"));
        let (snapshot, new_room) = joined(&mut inbox).await;
        assert!(!new_room);
        assert!(snapshot.is_some());
    }

    #[tokio::test]
    async fn test_ping_answered() {
        let server = spawn_server(MemoryPersistence::new(), LONG);
        let (a, mut inbox) = server.register();
        server.send(a, ClientMessage::Ping);
        assert_eq!(inbox.recv().await, Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_shutdown_flushes() {
        let store = Arc::new(MemoryPersistence::new());
        let server = spawn_server(Arc::clone(&store), LONG);
        let (a, mut inbox) = server.register();
        server.send(a, join("r"));
        joined(&mut inbox).await;
        server.send(
            a,
            ClientMessage::Update {
                room: "r".to_string(),
                seq: 1,
                update: edit(),
            },
        );
        inbox.recv().await;

        server.shutdown().await;
        assert!(store.get("r").is_some());
        assert!(server.rooms().await.is_empty());
    }
}
