//! WebSocket sync server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (page-<documentId>) ── DocumentReplica
//! Client B ──┘        │           │
//!                     │           └── Reconciler ── PageStore
//!                     │
//!              broadcast channel
//!                     │
//!          ┌──────────┼──────────┐
//!          ▼          ▼          ▼
//!       Client A   Client B   Client C
//! ```
//!
//! Every update is applied to the room's authoritative replica before
//! fan-out; duplicates detected there are not rebroadcast. A background
//! sweeper expires idle presence and collects rooms that stay empty
//! past a grace period, flushing their final state to storage.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::presence::DEFAULT_PRESENCE_TIMEOUT;
use crate::protocol::{MessageType, SyncMessage};
use crate::reconciler::{self, Reconciler, ReconcilerConfig};
use crate::room::{Room, RoomManager, DEFAULT_ROOM_GRACE};
use crate::store::PageStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How long an empty room lingers before collection
    pub room_grace: Duration,
    /// Idle interval after which a silent peer's presence expires
    pub presence_timeout: Duration,
    /// Cadence of the presence/room maintenance sweep
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            room_grace: DEFAULT_ROOM_GRACE,
            presence_timeout: DEFAULT_PRESENCE_TIMEOUT,
            sweep_interval: Duration::from_secs(10),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    /// Durable page storage; rooms bootstrap from it and flush to it.
    store: Option<Arc<dyn PageStore>>,
    /// One reconciler per live room, keyed by doc id.
    reconcilers: Arc<tokio::sync::Mutex<HashMap<String, Reconciler>>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(
            config.broadcast_capacity,
            config.presence_timeout,
            config.room_grace,
        ));
        Self {
            config,
            rooms,
            store: None,
            reconcilers: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration and no persistence.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Attach durable page storage. Rooms created after this will
    /// bootstrap from the store and flush edits back through a
    /// reconciler.
    pub fn with_store(mut self, store: Arc<dyn PageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn room_manager(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.room_count().await;
        stats
    }

    /// Bind, start the maintenance sweeper, and accept connections.
    pub async fn run(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("sync server listening on {}", listener.local_addr()?);

        self.clone().spawn_sweeper();

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                for doc_id in self.rooms.sweep().await {
                    if let Some(rec) = self.reconcilers.lock().await.remove(&doc_id) {
                        rec.shutdown().await;
                    }
                }
            }
        });
    }

    /// Resolve a room name to its room, bootstrapping it from storage
    /// and attaching a reconciler on first use.
    async fn room_for(&self, room_name: &str) -> Option<Arc<Room>> {
        let room = self.rooms.get_or_create_by_name(room_name).await?;
        let store = match &self.store {
            Some(store) => store,
            None => return Some(room),
        };

        let mut reconcilers = self.reconcilers.lock().await;
        if !reconcilers.contains_key(room.doc_id()) {
            match reconciler::bootstrap(store.as_ref(), &room).await {
                Ok(seeded) => {
                    log::info!("bootstrapped {room_name} with {seeded} stored blocks")
                }
                Err(e) => log::warn!("bootstrap failed for {room_name}: {e}"),
            }
            let rec = Reconciler::spawn(store.clone(), room.clone(), ReconcilerConfig::default()).await;
            reconcilers.insert(room.doc_id().to_string(), rec);
        }
        Some(room)
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state, populated by the first sync request.
        let mut peer_id: Option<Uuid> = None;
        let mut room: Option<Arc<Room>> = None;
        let mut room_name = String::new();
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            let sync_msg = match SyncMessage::decode(&bytes) {
                                Ok(m) => m,
                                Err(e) => {
                                    log::warn!("dropping undecodable frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            {
                                let mut s = self.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }

                            match sync_msg.msg_type {
                                MessageType::SyncRequest => {
                                    let joined = match self.room_for(&sync_msg.room).await {
                                        Some(r) => r,
                                        None => {
                                            log::warn!("{addr} requested unknown room {:?}", sync_msg.room);
                                            continue;
                                        }
                                    };

                                    let remote_sv = match sync_msg.request_state_vector() {
                                        Ok(sv) => sv,
                                        Err(e) => {
                                            log::warn!("bad sync request from {addr}: {e}");
                                            continue;
                                        }
                                    };

                                    peer_id = Some(sync_msg.peer_id);
                                    room_name = sync_msg.room.clone();
                                    broadcast_rx = Some(joined.join(sync_msg.peer_id).await);

                                    let frame = match joined.sync_response_for(remote_sv.as_ref()).await {
                                        Ok(response) => {
                                            SyncMessage::sync_response(&room_name, &response).encode()
                                        }
                                        Err(e) => {
                                            log::error!("sync response for {room_name} failed: {e}");
                                            room = Some(joined);
                                            continue;
                                        }
                                    };
                                    room = Some(joined);
                                    match frame {
                                        Ok(frame) => {
                                            if let Err(e) = ws_sender.send(Message::Binary(frame.into())).await {
                                                log::info!("send to {addr} failed: {e}");
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            log::error!("encoding sync response for {room_name} failed: {e}");
                                            continue;
                                        }
                                    }

                                    log::info!("peer {} joined {room_name}", sync_msg.peer_id);
                                }

                                MessageType::Update => {
                                    let Some(ref joined) = room else { continue };
                                    // Room replica first; only state-changing
                                    // updates are fanned out.
                                    match joined.apply_update(&sync_msg.payload).await {
                                        Ok(true) => {
                                            joined.broadcast_raw(Arc::new(bytes));
                                        }
                                        Ok(false) => {
                                            log::trace!("duplicate update from {addr} suppressed");
                                        }
                                        Err(e) => {
                                            log::warn!("rejected update from {addr}: {e}");
                                        }
                                    }
                                }

                                MessageType::PresenceUpdate => {
                                    let Some(ref joined) = room else { continue };
                                    match sync_msg.presence() {
                                        Ok(state) => {
                                            joined.apply_presence(state).await;
                                            joined.broadcast_raw(Arc::new(bytes));
                                        }
                                        Err(e) => {
                                            log::warn!("bad presence from {addr}: {e}");
                                        }
                                    }
                                }

                                MessageType::PresenceLeave => {
                                    let Some(ref joined) = room else { continue };
                                    joined.leave(sync_msg.peer_id).await;
                                    joined.broadcast_raw(Arc::new(bytes));
                                }

                                MessageType::Ping => {
                                    let Ok(pong) = SyncMessage::pong(sync_msg.peer_id).encode() else {
                                        continue;
                                    };
                                    if let Err(e) = ws_sender.send(Message::Binary(pong.into())).await {
                                        log::info!("send to {addr} failed: {e}");
                                        break;
                                    }
                                }

                                _ => {
                                    log::debug!("unhandled message type {:?} from {addr}", sync_msg.msg_type);
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                log::info!("send to {addr} failed: {e}");
                                break;
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx {
                        Some(ref mut rx) => rx.recv().await,
                        // Not in a room yet; park this arm.
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(data) => {
                            // Don't echo the sender's own frames back.
                            if let Ok(m) = SyncMessage::decode(&data) {
                                if Some(m.peer_id) == peer_id {
                                    continue;
                                }
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(data.to_vec().into())).await {
                                log::info!("forward to {addr} failed: {e}");
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("peer {peer_id:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Cleanup: drop membership and announce the departure.
        if let (Some(pid), Some(joined)) = (peer_id, room) {
            joined.leave(pid).await;
            if let Ok(frame) = SyncMessage::presence_leave(pid, &room_name).encode() {
                joined.broadcast_raw(Arc::new(frame));
            }
            log::info!("peer {pid} left {room_name}");
        }

        let mut s = self.stats.write().await;
        s.active_connections -= 1;
        Ok(())
    }
}
