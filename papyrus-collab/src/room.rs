//! Rooms: per-document broadcast groups with an authoritative replica.
//!
//! One room exists per open document, named `page-<documentId>`. The
//! room is the serialization point for a document: every update passes
//! through its replica before fan-out, so all clients observe a single
//! authoritative order. Fan-out uses a tokio broadcast channel of
//! pre-encoded frames, one independent receiver per connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use papyrus_core::{doc_id_of, CrdtError, DocumentReplica, ReplicaId, StateVector};

use crate::presence::{PresenceState, PresenceTracker};
use crate::protocol::{SyncMessage, SyncPayload, SyncResponse};

/// How long an empty room lingers before it becomes collectable.
pub const DEFAULT_ROOM_GRACE: Duration = Duration::from_secs(60);

/// One document's room: authoritative replica, presence set, and
/// broadcast channel.
pub struct Room {
    doc_id: String,
    replica: RwLock<DocumentReplica>,
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    presence: RwLock<PresenceTracker>,
    members: RwLock<HashSet<Uuid>>,
    /// Set when the last member leaves; cleared on join.
    empty_since: RwLock<Option<Instant>>,
}

impl Room {
    pub fn new(doc_id: &str, capacity: usize, presence_timeout: Duration) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            doc_id: doc_id.to_string(),
            replica: RwLock::new(DocumentReplica::new(doc_id)),
            sender,
            presence: RwLock::new(PresenceTracker::new(presence_timeout)),
            members: RwLock::new(HashSet::new()),
            // A freshly created room has no members yet.
            empty_since: RwLock::new(Some(Instant::now())),
        }
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub async fn room_name(&self) -> String {
        self.replica.read().await.room().to_string()
    }

    /// Add a member and hand it a broadcast receiver.
    pub async fn join(&self, peer_id: Uuid) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.members.write().await.insert(peer_id);
        *self.empty_since.write().await = None;
        self.sender.subscribe()
    }

    /// Remove a member and its presence. Stamps the grace timer when
    /// the room becomes empty.
    pub async fn leave(&self, peer_id: Uuid) -> Option<PresenceState> {
        let left = self.presence.write().await.remove(peer_id);
        let mut members = self.members.write().await;
        members.remove(&peer_id);
        if members.is_empty() {
            *self.empty_since.write().await = Some(Instant::now());
        }
        left
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Apply an encoded update to the room replica.
    ///
    /// Returns `Ok(true)` when the update changed room state and should
    /// be rebroadcast; `Ok(false)` when it was a duplicate.
    pub async fn apply_update(&self, bytes: &[u8]) -> Result<bool, CrdtError> {
        self.replica.write().await.apply_remote(bytes)
    }

    /// Build the sync response for a joining or reconnecting peer: a
    /// diff when the peer's state vector is recent enough to serve
    /// incrementally, a full snapshot otherwise.
    pub async fn sync_response_for(
        &self,
        remote: Option<&StateVector>,
    ) -> Result<SyncResponse, CrdtError> {
        let replica = self.replica.read().await;
        let payload = match remote {
            Some(sv) if replica.can_diff(sv) => SyncPayload::Diff(replica.diff(sv)?),
            _ => SyncPayload::Snapshot(replica.snapshot()?),
        };
        Ok(SyncResponse {
            payload,
            presence: self.presence.read().await.snapshot(),
        })
    }

    pub async fn state_vector(&self) -> StateVector {
        self.replica.read().await.state_vector()
    }

    pub async fn replica_id(&self) -> ReplicaId {
        self.replica.read().await.id()
    }

    pub async fn with_replica<R>(&self, f: impl FnOnce(&mut DocumentReplica) -> R) -> R {
        f(&mut *self.replica.write().await)
    }

    /// Store a peer's presence, refreshing its liveness stamp.
    pub async fn apply_presence(&self, state: PresenceState) {
        self.presence.write().await.apply(state);
    }

    pub async fn presence_snapshot(&self) -> Vec<PresenceState> {
        self.presence.read().await.snapshot()
    }

    pub async fn presence_count(&self) -> usize {
        self.presence.read().await.len()
    }

    /// Expire idle presence and announce each departure to the room.
    pub async fn sweep_presence(&self, room_name: &str) -> Vec<Uuid> {
        let expired = self.presence.write().await.expire(Instant::now());
        for &peer_id in &expired {
            log::debug!("presence timeout for {peer_id} in {room_name}");
            if let Ok(frame) = SyncMessage::presence_leave(peer_id, room_name).encode() {
                self.broadcast_raw(Arc::new(frame));
            }
        }
        expired
    }

    /// Fan a pre-encoded frame out to every subscribed receiver.
    /// Receivers skip frames authored by their own peer.
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    /// Whether this room has been empty longer than `grace`.
    pub async fn collectable(&self, grace: Duration) -> bool {
        if !self.members.read().await.is_empty() {
            return false;
        }
        match *self.empty_since.read().await {
            Some(since) => since.elapsed() > grace,
            None => false,
        }
    }
}

/// Maps document ids to their rooms; owns room lifecycle.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    capacity: usize,
    presence_timeout: Duration,
    grace: Duration,
}

impl RoomManager {
    pub fn new(capacity: usize, presence_timeout: Duration, grace: Duration) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            presence_timeout,
            grace,
        }
    }

    /// Get or lazily create the room for `doc_id`.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<Room> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(doc_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring the write lock.
        if let Some(room) = rooms.get(doc_id) {
            return room.clone();
        }

        log::info!("creating room page-{doc_id}");
        let room = Arc::new(Room::new(doc_id, self.capacity, self.presence_timeout));
        rooms.insert(doc_id.to_string(), room.clone());
        room
    }

    /// Resolve a `page-<documentId>` room name to its room, creating
    /// it if needed. Returns `None` for names outside the scheme.
    pub async fn get_or_create_by_name(&self, room_name: &str) -> Option<Arc<Room>> {
        let doc_id = doc_id_of(room_name)?;
        Some(self.get_or_create(doc_id).await)
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }

    /// Periodic maintenance: expire idle presence everywhere and drop
    /// rooms that have been empty past the grace period. Returns the
    /// doc ids of collected rooms.
    pub async fn sweep(&self) -> Vec<String> {
        let rooms: Vec<(String, Arc<Room>)> = {
            let guard = self.rooms.read().await;
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut collectable = Vec::new();
        for (doc_id, room) in rooms {
            let name = room.room_name().await;
            room.sweep_presence(&name).await;
            if room.collectable(self.grace).await {
                collectable.push(doc_id);
            }
        }

        if collectable.is_empty() {
            return collectable;
        }

        let mut guard = self.rooms.write().await;
        let mut collected = Vec::new();
        for doc_id in collectable {
            // Re-check under the write lock; a peer may have joined.
            if let Some(room) = guard.get(&doc_id) {
                if room.collectable(self.grace).await {
                    guard.remove(&doc_id);
                    log::info!("collected idle room page-{doc_id}");
                    collected.push(doc_id);
                }
            }
        }
        collected
    }
}
