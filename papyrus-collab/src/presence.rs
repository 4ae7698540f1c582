//! Ephemeral presence: who is in the room and what they focus.
//!
//! Presence is broadcast alongside document updates but never merged
//! into persistent history — there is no state-vector tracking for it,
//! and it dies with its owning connection. Liveness is timeout-based,
//! driven by message receipt timestamps rather than polling: a peer
//! that stops refreshing its presence is treated as departed even
//! without an explicit leave.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Idle interval after which a silent peer is considered departed.
pub const DEFAULT_PRESENCE_TIMEOUT: Duration = Duration::from_secs(30);

/// One peer's ephemeral state, replaced whole on every update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub peer_id: Uuid,
    pub name: String,
    /// CSS color string, stable per peer (`hsl(H, 70%, 50%)`).
    pub color: String,
    /// Block the peer currently focuses, if any.
    pub focused_block: Option<String>,
}

impl PresenceState {
    pub fn new(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
            color: stable_color(peer_id),
            focused_block: None,
        }
    }

    /// Presence with a generated `user<N>` display name.
    pub fn anonymous(peer_id: Uuid) -> Self {
        Self::new(peer_id, default_name(peer_id))
    }

    pub fn with_focus(mut self, block_id: impl Into<String>) -> Self {
        self.focused_block = Some(block_id.into());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        // Fixed shape; serialization cannot fail.
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(state)
    }
}

/// Stable, visually distinct color from a peer id.
pub fn stable_color(peer_id: Uuid) -> String {
    let hue = (peer_id.as_u128() % 360) as u16;
    format!("hsl({hue}, 70%, 50%)")
}

/// Deterministic `user<N>` display name for a peer.
pub fn default_name(peer_id: Uuid) -> String {
    let n = (peer_id.as_u128() % 1000) + 1;
    format!("user{n}")
}

struct TrackedPeer {
    state: PresenceState,
    last_seen: Instant,
}

/// Presence book-keeping for one room, keyed by peer.
///
/// Used both server-side (authoritative set sent to joiners) and
/// client-side (what the UI shows as online users).
pub struct PresenceTracker {
    peers: HashMap<Uuid, TrackedPeer>,
    timeout: Duration,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            timeout,
        }
    }

    /// Full replacement of a peer's state; stamps receipt time.
    pub fn apply(&mut self, state: PresenceState) {
        self.peers.insert(
            state.peer_id,
            TrackedPeer {
                state,
                last_seen: Instant::now(),
            },
        );
    }

    pub fn remove(&mut self, peer_id: Uuid) -> Option<PresenceState> {
        self.peers.remove(&peer_id).map(|p| p.state)
    }

    /// Remove peers idle longer than the timeout; returns who expired.
    pub fn expire(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| now.duration_since(p.last_seen) > timeout)
            .map(|(&id, _)| id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn get(&self, peer_id: Uuid) -> Option<&PresenceState> {
        self.peers.get(&peer_id).map(|p| &p.state)
    }

    pub fn contains(&self, peer_id: Uuid) -> bool {
        self.peers.contains_key(&peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// All current presence states, ordered by name then peer id so
    /// every replica renders the same participant list.
    pub fn snapshot(&self) -> Vec<PresenceState> {
        let mut states: Vec<PresenceState> = self.peers.values().map(|p| p.state.clone()).collect();
        states.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.peer_id.cmp(&b.peer_id)));
        states
    }

    /// Deduplicated display names of everyone currently present.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.values().map(|p| p.state.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PRESENCE_TIMEOUT)
    }
}
