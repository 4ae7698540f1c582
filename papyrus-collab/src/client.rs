//! WebSocket sync client for one room.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with a
//!   retained state vector)
//! - Update send/receive as opaque encoded frames
//! - Presence updates
//! - Offline queue for edits made while disconnected
//!
//! The client never interprets update bytes; it moves them between
//! the wire and the owning [`crate::adapter::ClientSyncAdapter`].

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use papyrus_core::StateVector;

use crate::presence::PresenceState;
use crate::protocol::{MessageType, ProtocolError, SyncMessage, SyncPayload};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The room answered our sync request
    Synced {
        payload: SyncPayload,
        presence: Vec<PresenceState>,
    },
    /// An encoded update from a remote peer
    RemoteUpdate(Vec<u8>),
    /// A remote peer's presence changed
    RemotePresence(PresenceState),
    /// A remote peer departed
    PresenceLeft(Uuid),
}

/// Edits queued while disconnected, replayed on reconnection.
pub struct OfflineQueue {
    queue: VecDeque<Vec<u8>>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an encoded update; returns false when full.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(payload);
        true
    }

    pub fn drain(&mut self) -> Vec<Vec<u8>> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|p| p.len()).sum()
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to one room, forwards encoded
/// updates both ways, and queues outgoing updates while offline.
pub struct SyncClient {
    peer_id: Uuid,
    room: String,
    state: Arc<RwLock<ConnectionState>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    pub fn new(peer_id: Uuid, room: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            peer_id,
            room: room.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            outgoing_tx: Arc::new(RwLock::new(None)),
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and send the sync request.
    ///
    /// `state_vector` is `None` on a first join; on reconnection pass
    /// the adapter's current vector so the room can answer with a
    /// minimal diff. Spawns reader and writer tasks and replays the
    /// offline queue.
    pub async fn connect(&self, state_vector: Option<&StateVector>) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        let (ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        *self.outgoing_tx.write().await = Some(out_tx.clone());

        // Writer task: forward the outgoing channel to the socket.
        let writer = Arc::new(Mutex::new(ws_writer));
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                use futures_util::SinkExt;
                let mut w = writer.lock().await;
                if w.send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let request = SyncMessage::sync_request(self.peer_id, &self.room, state_vector);
        out_tx
            .send(request.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Replay edits made while offline.
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("replaying {} queued updates for {}", queued.len(), self.room);
                for payload in queued {
                    let msg = SyncMessage::update(self.peer_id, &self.room, payload);
                    let _ = out_tx.send(msg.encode()?).await;
                }
            }
        }

        // Reader task: translate incoming frames to events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_id;
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let Ok(sync_msg) = SyncMessage::decode(&bytes) else {
                            log::warn!("dropping undecodable frame");
                            continue;
                        };
                        // Skip our own frames.
                        if sync_msg.peer_id == peer_id {
                            continue;
                        }

                        let event = match sync_msg.msg_type {
                            MessageType::SyncResponse => match sync_msg.response() {
                                Ok(response) => Some(SyncEvent::Synced {
                                    payload: response.payload,
                                    presence: response.presence,
                                }),
                                Err(e) => {
                                    log::warn!("bad sync response: {e}");
                                    None
                                }
                            },
                            MessageType::Update => {
                                Some(SyncEvent::RemoteUpdate(sync_msg.payload))
                            }
                            MessageType::PresenceUpdate => {
                                sync_msg.presence().ok().map(SyncEvent::RemotePresence)
                            }
                            MessageType::PresenceLeave => {
                                Some(SyncEvent::PresenceLeft(sync_msg.peer_id))
                            }
                            _ => None,
                        };

                        if let Some(evt) = event {
                            let _ = event_tx.send(evt).await;
                        }
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => {
                        break;
                    }
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send an encoded update to the room; queued when disconnected.
    pub async fn send_update(&self, update: Vec<u8>) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(update) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        let msg = SyncMessage::update(self.peer_id, &self.room, update);
        self.send_frame(msg.encode()?).await
    }

    /// Send our presence; silently dropped when offline, since stale
    /// presence is worthless on reconnect.
    pub async fn send_presence(&self, presence: &PresenceState) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let msg = SyncMessage::presence_update(self.peer_id, &self.room, presence);
        self.send_frame(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send_frame(SyncMessage::ping(self.peer_id).encode()?).await
    }

    async fn send_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        let guard = self.outgoing_tx.read().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
