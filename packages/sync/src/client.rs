//! # Sync client
//!
//! [`SyncClient`] owns one websocket connection, driven by a background
//! task. Each joined room gets a [`RoomHandle`]; the caller keeps exclusive
//! ownership of its [`Document`] and moves ops across with
//! [`RoomHandle::push`] / [`RoomHandle::pull`].
//!
//! The background task:
//! - pings the server every `ping_interval` and treats a ping unanswered for
//!   `pong_timeout` as a dropped connection
//! - reconnects with exponential backoff, rejoins every room with the
//!   version it already has, and resends unacknowledged updates
//! - reports [`ConnectionStatus::Lost`] once `reconnect_timeout` passes
//!   without a connection; local documents are untouched and whatever was
//!   not pushed can be pushed again through a new client
//!
//! ```no_run
//! use grove_editor::Document;
//! use grove_sync::SyncClient;
//!
//! # async fn demo() -> Result<(), grove_sync::SyncError> {
//! let client = SyncClient::connect("ws://127.0.0.1:3001/ws").await?;
//! let mut doc = Document::new();
//! let mut room = client.join("landing-page", &mut doc).await?;
//! room.wait_for_reaching_server_version(&mut doc).await?;
//!
//! if room.is_new_room() {
//!     doc.change(|tx| tx.create_root_node("section"))?;
//!     room.push(&doc)?;
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use grove_crdt::VersionVector;
use grove_editor::{Document, ImportStatus};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::{ClientConfig, ClientMessage, RoomId, ServerMessage, SyncError};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    /// Reconnecting timed out; the client is finished
    Lost,
    Closed,
}

struct Joined {
    snapshot: Option<Vec<u8>>,
    new_room: bool,
    version: VersionVector,
}

type JoinReply = oneshot::Sender<Result<Joined, SyncError>>;

enum ClientCommand {
    Join {
        room: RoomId,
        link: RoomLink,
        reply: JoinReply,
    },
    Push {
        room: RoomId,
        update: Vec<u8>,
    },
    Flush {
        room: RoomId,
        reply: oneshot::Sender<()>,
    },
    Leave {
        room: RoomId,
    },
    Close,
}

/// Connection-side state of one joined room
struct RoomLink {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Version of the local document, sent when rejoining
    known: Arc<Mutex<VersionVector>>,
    /// Local ops offered with the first join, until it is answered
    join_update: Option<Vec<u8>>,
    unacked: Vec<(u64, Vec<u8>)>,
    flush_waiters: Vec<oneshot::Sender<()>>,
}

impl RoomLink {
    fn join_message(&self, room: &str) -> ClientMessage {
        ClientMessage::Join {
            room: room.to_string(),
            version: Some(lock(&self.known).clone()),
            update: self.join_update.clone(),
        }
    }
}

fn lock(version: &Mutex<VersionVector>) -> std::sync::MutexGuard<'_, VersionVector> {
    version.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct SyncClient {
    url: String,
    commands: mpsc::UnboundedSender<ClientCommand>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl SyncClient {
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        Self::connect_with(url, ClientConfig::default()).await
    }

    pub async fn connect_with(url: &str, config: ClientConfig) -> Result<Self, SyncError> {
        let socket = tokio::time::timeout(config.reconnect_timeout, open(url))
            .await
            .map_err(|_| SyncError::Transport(format!("timed out connecting to {}", url)))??;
        info!(url, "connected");

        let (commands, inbox) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionStatus::Connected);
        let connection = Connection {
            url: url.to_string(),
            config,
            commands: inbox,
            status: status_tx,
            rooms: HashMap::new(),
            joins: HashMap::new(),
            next_seq: 1,
        };
        let task = tokio::spawn(connection.run(socket));
        Ok(Self {
            url: url.to_string(),
            commands,
            status,
            task,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Join `room`, offering every op `doc` already holds, and apply the
    /// server's state to `doc` before returning.
    pub async fn join(&self, room: &str, doc: &mut Document) -> Result<RoomHandle, SyncError> {
        let join_update = if doc.version().is_empty() {
            None
        } else {
            Some(doc.export_snapshot()?)
        };
        let known = Arc::new(Mutex::new(doc.version().clone()));
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        let (reply, joined) = oneshot::channel();
        let link = RoomLink {
            inbound: inbound_tx,
            known: Arc::clone(&known),
            join_update,
            unacked: Vec::new(),
            flush_waiters: Vec::new(),
        };
        self.commands
            .send(ClientCommand::Join {
                room: room.to_string(),
                link,
                reply,
            })
            .map_err(|_| SyncError::ConnectionLost)?;

        let joined = joined.await.map_err(|_| SyncError::ConnectionLost)??;
        if let Some(snapshot) = &joined.snapshot {
            doc.import(snapshot)?;
        }
        *lock(&known) = doc.version().clone();
        debug!(room, new_room = joined.new_room, "joined room");

        Ok(RoomHandle {
            room: room.to_string(),
            commands: self.commands.clone(),
            inbound,
            known,
            server_version: joined.version,
            new_room: joined.new_room,
            pushed: doc.version().clone(),
        })
    }

    /// Close the connection and wait for the background task to finish
    pub async fn close(self) {
        let _ = self.commands.send(ClientCommand::Close);
        let _ = self.task.await;
    }
}

/// One joined room. Dropping it keeps the membership; call
/// [`RoomHandle::leave`] to leave.
pub struct RoomHandle {
    room: RoomId,
    commands: mpsc::UnboundedSender<ClientCommand>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    known: Arc<Mutex<VersionVector>>,
    server_version: VersionVector,
    new_room: bool,
    /// Everything the server is known to have
    pushed: VersionVector,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room
    }

    /// The server had nothing stored for this room when we joined
    pub fn is_new_room(&self) -> bool {
        self.new_room
    }

    /// Server version at join time
    pub fn server_version(&self) -> &VersionVector {
        &self.server_version
    }

    /// Send local ops the server has not seen yet. Returns `false` when
    /// there was nothing to send.
    pub fn push(&mut self, doc: &Document) -> Result<bool, SyncError> {
        if self.pushed.covers(doc.version()) {
            return Ok(false);
        }
        let update = doc.export_updates(&self.pushed)?;
        self.commands
            .send(ClientCommand::Push {
                room: self.room.clone(),
                update,
            })
            .map_err(|_| SyncError::ConnectionLost)?;
        self.pushed.merge(doc.version());
        *lock(&self.known) = doc.version().clone();
        Ok(true)
    }

    /// Import every remote update received so far. Returns the number of
    /// ops applied.
    pub fn pull(&mut self, doc: &mut Document) -> Result<usize, SyncError> {
        let mut applied = 0;
        loop {
            match self.inbound.try_recv() {
                Ok(update) => applied += self.integrate(doc, &update)?.applied,
                Err(mpsc::error::TryRecvError::Empty) => return Ok(applied),
                Err(mpsc::error::TryRecvError::Disconnected) if applied == 0 => {
                    return Err(SyncError::ConnectionLost)
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return Ok(applied),
            }
        }
    }

    /// Wait for the next remote update and import it
    pub async fn next_update(&mut self, doc: &mut Document) -> Result<ImportStatus, SyncError> {
        let update = self.inbound.recv().await.ok_or(SyncError::ConnectionLost)?;
        self.integrate(doc, &update)
    }

    /// Resolve once `doc` has everything the server had when we joined.
    /// Fails if the connection is lost first.
    pub async fn wait_for_reaching_server_version(
        &mut self,
        doc: &mut Document,
    ) -> Result<(), SyncError> {
        while !doc.version().covers(&self.server_version) {
            self.next_update(doc).await?;
        }
        Ok(())
    }

    /// Resolve once the server acknowledged every pushed update
    pub async fn flush(&self) -> Result<(), SyncError> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(ClientCommand::Flush {
                room: self.room.clone(),
                reply,
            })
            .map_err(|_| SyncError::ConnectionLost)?;
        done.await.map_err(|_| SyncError::ConnectionLost)
    }

    pub fn leave(self) {
        let _ = self.commands.send(ClientCommand::Leave { room: self.room });
    }

    fn integrate(&mut self, doc: &mut Document, update: &[u8]) -> Result<ImportStatus, SyncError> {
        let peer = doc.peer_id();
        let local = self.pushed.get(peer);
        let status = doc.import(update)?;
        // remote ops are on the server already; our own unpushed ones are not
        self.pushed.merge(doc.version());
        self.pushed.set_end(peer, local);
        *lock(&self.known) = doc.version().clone();
        Ok(status)
    }
}

async fn open(url: &str) -> Result<Socket, SyncError> {
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    Ok(socket)
}

async fn send(socket: &mut Socket, message: &ClientMessage) -> Result<(), SyncError> {
    socket
        .send(Message::Binary(message.encode()?))
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

enum SessionEnd {
    Closed,
    Dropped(String),
}

enum Reconnect {
    Connected(Socket),
    Closed,
    Lost,
}

/// Background task behind a [`SyncClient`]
struct Connection {
    url: String,
    config: ClientConfig,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    status: watch::Sender<ConnectionStatus>,
    rooms: HashMap<RoomId, RoomLink>,
    /// Joins waiting for their first `Joined`
    joins: HashMap<RoomId, JoinReply>,
    next_seq: u64,
}

impl Connection {
    async fn run(mut self, mut socket: Socket) {
        let mut resume = false;
        loop {
            match self.session(&mut socket, resume).await {
                SessionEnd::Closed => {
                    self.status.send_replace(ConnectionStatus::Closed);
                    debug!(url = %self.url, "connection closed");
                    return;
                }
                SessionEnd::Dropped(reason) => {
                    warn!(url = %self.url, reason = %reason, "connection dropped");
                    self.status.send_replace(ConnectionStatus::Reconnecting);
                }
            }

            match self.reconnect().await {
                Reconnect::Connected(next) => {
                    socket = next;
                    resume = true;
                }
                Reconnect::Closed => {
                    self.status.send_replace(ConnectionStatus::Closed);
                    return;
                }
                Reconnect::Lost => {
                    error!(
                        url = %self.url,
                        timeout = ?self.config.reconnect_timeout,
                        "connection lost"
                    );
                    self.status.send_replace(ConnectionStatus::Lost);
                    // dropping `self` fails every pending join, flush and wait
                    return;
                }
            }
        }
    }

    async fn session(&mut self, socket: &mut Socket, resume: bool) -> SessionEnd {
        if resume {
            if let Err(err) = self.resume(socket).await {
                return SessionEnd::Dropped(err.to_string());
            }
            self.status.send_replace(ConnectionStatus::Connected);
            info!(url = %self.url, rooms = self.rooms.len(), "reconnected");
        }

        let period = self.config.ping_interval;
        let mut ping = tokio::time::interval_at(Instant::now() + period, period);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    None | Some(ClientCommand::Close) => {
                        let _ = socket.close(None).await;
                        return SessionEnd::Closed;
                    }
                    Some(command) => {
                        if let Err(err) = self.apply(command, Some(&mut *socket)).await {
                            return SessionEnd::Dropped(err.to_string());
                        }
                    }
                },
                frame = socket.next() => match frame {
                    Some(Ok(Message::Binary(bytes))) => {
                        // any frame proves the server is alive
                        pong_deadline = None;
                        self.on_frame(&bytes);
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Dropped("closed by server".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return SessionEnd::Dropped(err.to_string()),
                },
                _ = ping.tick() => {
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                    if let Err(err) = send(socket, &ClientMessage::Ping).await {
                        return SessionEnd::Dropped(err.to_string());
                    }
                }
                _ = sleep_until(pong_deadline) => {
                    return SessionEnd::Dropped("pong timeout".to_string());
                }
            }
        }
    }

    /// Rejoin every room and resend what the server never acknowledged
    async fn resume(&mut self, socket: &mut Socket) -> Result<(), SyncError> {
        for (room, link) in &self.rooms {
            send(socket, &link.join_message(room)).await?;
            for (seq, update) in &link.unacked {
                let message = ClientMessage::Update {
                    room: room.clone(),
                    seq: *seq,
                    update: update.clone(),
                };
                send(socket, &message).await?;
            }
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Reconnect {
        let deadline = Instant::now() + self.config.reconnect_timeout;
        let mut backoff = self.config.initial_backoff;
        loop {
            match tokio::time::timeout_at(deadline, open(&self.url)).await {
                Ok(Ok(socket)) => return Reconnect::Connected(socket),
                Ok(Err(err)) => debug!(url = %self.url, error = %err, "reconnect attempt failed"),
                Err(_) => return Reconnect::Lost,
            }
            if Instant::now() >= deadline {
                return Reconnect::Lost;
            }

            // keep accepting commands while offline; they go out on resume
            let wake = (Instant::now() + backoff).min(deadline);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(wake) => break,
                    command = self.commands.recv() => match command {
                        None | Some(ClientCommand::Close) => return Reconnect::Closed,
                        Some(command) => {
                            let _ = self.apply(command, None).await;
                        }
                    },
                }
            }
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    async fn apply(
        &mut self,
        command: ClientCommand,
        socket: Option<&mut Socket>,
    ) -> Result<(), SyncError> {
        match command {
            ClientCommand::Join { room, link, reply } => {
                let message = link.join_message(&room);
                self.rooms.insert(room.clone(), link);
                self.joins.insert(room, reply);
                if let Some(socket) = socket {
                    send(socket, &message).await?;
                }
            }
            ClientCommand::Push { room, update } => {
                let Some(link) = self.rooms.get_mut(&room) else {
                    return Ok(());
                };
                let seq = self.next_seq;
                self.next_seq += 1;
                link.unacked.push((seq, update.clone()));
                if let Some(socket) = socket {
                    send(socket, &ClientMessage::Update { room, seq, update }).await?;
                }
            }
            ClientCommand::Flush { room, reply } => match self.rooms.get_mut(&room) {
                Some(link) if !link.unacked.is_empty() => link.flush_waiters.push(reply),
                _ => {
                    let _ = reply.send(());
                }
            },
            ClientCommand::Leave { room } => {
                self.rooms.remove(&room);
                self.joins.remove(&room);
                if let Some(socket) = socket {
                    send(socket, &ClientMessage::Leave { room }).await?;
                }
            }
            ClientCommand::Close => {}
        }
        Ok(())
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let message = match ServerMessage::decode(bytes) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };
        match message {
            ServerMessage::Joined {
                room,
                snapshot,
                new_room,
                version,
            } => {
                let Some(link) = self.rooms.get_mut(&room) else {
                    return;
                };
                link.join_update = None;
                match self.joins.remove(&room) {
                    Some(reply) => {
                        let _ = reply.send(Ok(Joined {
                            snapshot,
                            new_room,
                            version,
                        }));
                    }
                    // a rejoin: missing ops arrive like any remote update
                    None => {
                        if let Some(snapshot) = snapshot {
                            let _ = link.inbound.send(snapshot);
                        }
                    }
                }
            }
            ServerMessage::Update { room, update } => {
                if let Some(link) = self.rooms.get(&room) {
                    let _ = link.inbound.send(update);
                }
            }
            ServerMessage::Ack { room, seq } => {
                if let Some(link) = self.rooms.get_mut(&room) {
                    link.unacked.retain(|(pending, _)| *pending > seq);
                    if link.unacked.is_empty() {
                        for waiter in link.flush_waiters.drain(..) {
                            let _ = waiter.send(());
                        }
                    }
                }
            }
            ServerMessage::Pong => {}
            ServerMessage::Error {
                room: Some(room),
                message,
            } => match self.joins.remove(&room) {
                Some(reply) => {
                    self.rooms.remove(&room);
                    let _ = reply.send(Err(SyncError::Rejected { room, message }));
                }
                None => warn!(room = %room, error = %message, "server error"),
            },
            ServerMessage::Error {
                room: None,
                message,
            } => warn!(error = %message, "server error"),
        }
    }
}
