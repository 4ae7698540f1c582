//! Binary wire protocol for room-based synchronization.
//!
//! Every frame is one bincode-encoded [`SyncMessage`]:
//! ```text
//! ┌──────────┬───────────┬─────────────┬──────────┐
//! │ msg_type │ peer_id   │ room        │ payload  │
//! │ 1 byte   │ 16 bytes  │ var string  │ variable │
//! └──────────┴───────────┴─────────────┴──────────┘
//! ```
//!
//! The `room` field carries the `page-<documentId>` name that binds a
//! connection to a document. Malformed frames decode to an error and
//! are dropped by recipients — never fatal.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceState;
use papyrus_core::StateVector;

/// Message kinds exchanged over a (connection, room) channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Client → room on join; empty payload or the client's state
    /// vector when resuming.
    SyncRequest = 1,
    /// Room → client: full snapshot for fresh joiners, else a diff,
    /// plus the current presence set.
    SyncResponse = 2,
    /// One encoded CRDT update, either direction.
    Update = 3,
    /// Full replacement of the sender's presence state.
    PresenceUpdate = 4,
    /// A peer's presence was removed (disconnect or timeout).
    PresenceLeave = 5,
    /// Heartbeat ping.
    Ping = 6,
    /// Heartbeat pong.
    Pong = 7,
}

/// Document state carried by a sync response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SyncPayload {
    /// Full replica snapshot — the client had no prior state vector,
    /// or its missing updates fell out of the retained history.
    Snapshot(Vec<u8>),
    /// Exactly the encoded updates the client has not seen.
    Diff(Vec<Vec<u8>>),
}

/// Payload of a [`MessageType::SyncResponse`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub payload: SyncPayload,
    /// Everyone currently present in the room.
    pub presence: Vec<PresenceState>,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Join / resume request. `state_vector` is `None` on a first
    /// join and the retained vector on reconnect.
    pub fn sync_request(peer_id: Uuid, room: impl Into<String>, state_vector: Option<&StateVector>) -> Self {
        Self {
            msg_type: MessageType::SyncRequest,
            peer_id,
            room: room.into(),
            payload: state_vector.map(|sv| sv.encode()).unwrap_or_default(),
        }
    }

    /// Room's answer to a sync request. Authored by the room itself,
    /// so `peer_id` is nil.
    pub fn sync_response(room: impl Into<String>, response: &SyncResponse) -> Self {
        let payload = bincode::serde::encode_to_vec(response, bincode::config::standard())
            .unwrap_or_default();
        Self {
            msg_type: MessageType::SyncResponse,
            peer_id: Uuid::nil(),
            room: room.into(),
            payload,
        }
    }

    /// One encoded CRDT update.
    pub fn update(peer_id: Uuid, room: impl Into<String>, update: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::Update,
            peer_id,
            room: room.into(),
            payload: update,
        }
    }

    pub fn presence_update(peer_id: Uuid, room: impl Into<String>, state: &PresenceState) -> Self {
        Self {
            msg_type: MessageType::PresenceUpdate,
            peer_id,
            room: room.into(),
            payload: state.encode(),
        }
    }

    pub fn presence_leave(peer_id: Uuid, room: impl Into<String>) -> Self {
        Self {
            msg_type: MessageType::PresenceLeave,
            peer_id,
            room: room.into(),
            payload: Vec::new(),
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Ping,
            peer_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self {
            msg_type: MessageType::Pong,
            peer_id,
            room: String::new(),
            payload: Vec::new(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the resume state vector of a sync request, if present.
    pub fn request_state_vector(&self) -> Result<Option<StateVector>, ProtocolError> {
        if self.msg_type != MessageType::SyncRequest {
            return Err(ProtocolError::InvalidMessageType);
        }
        if self.payload.is_empty() {
            return Ok(None);
        }
        StateVector::decode(&self.payload)
            .map(Some)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    /// Parse a sync response payload.
    pub fn response(&self) -> Result<SyncResponse, ProtocolError> {
        if self.msg_type != MessageType::SyncResponse {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (response, _) = bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(response)
    }

    /// Parse a presence payload.
    pub fn presence(&self) -> Result<PresenceState, ProtocolError> {
        if self.msg_type != MessageType::PresenceUpdate {
            return Err(ProtocolError::InvalidMessageType);
        }
        PresenceState::decode(&self.payload).map_err(ProtocolError::Deserialization)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    InvalidMessageType,
    ConnectionClosed,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "invalid message type"),
            Self::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use papyrus_core::ReplicaId;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(peer, "page-42", payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.room, "page-42");
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_sync_request_without_state_vector() {
        let msg = SyncMessage::sync_request(Uuid::new_v4(), "page-42", None);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::SyncRequest);
        assert!(decoded.request_state_vector().unwrap().is_none());
    }

    #[test]
    fn test_sync_request_with_state_vector() {
        let sv: StateVector = [(ReplicaId::new(), 7)].into_iter().collect();
        let msg = SyncMessage::sync_request(Uuid::new_v4(), "page-42", Some(&sv));
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.request_state_vector().unwrap().unwrap(), sv);
    }

    #[test]
    fn test_sync_response_roundtrip() {
        let response = SyncResponse {
            payload: SyncPayload::Diff(vec![vec![1, 2], vec![3]]),
            presence: vec![PresenceState::new(Uuid::new_v4(), "Alice")],
        };
        let msg = SyncMessage::sync_response("page-42", &response);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.peer_id, Uuid::nil());
        let parsed = decoded.response().unwrap();
        match parsed.payload {
            SyncPayload::Diff(updates) => assert_eq!(updates.len(), 2),
            SyncPayload::Snapshot(_) => panic!("expected diff"),
        }
        assert_eq!(parsed.presence.len(), 1);
        assert_eq!(parsed.presence[0].name, "Alice");
    }

    #[test]
    fn test_presence_update_roundtrip() {
        let state = PresenceState::new(Uuid::new_v4(), "Bob").with_focus("b3");
        let msg = SyncMessage::presence_update(state.peer_id, "page-42", &state);
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PresenceUpdate);
        assert_eq!(decoded.presence().unwrap(), state);
    }

    #[test]
    fn test_presence_leave_roundtrip() {
        let peer = Uuid::new_v4();
        let msg = SyncMessage::presence_leave(peer, "page-42");
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::PresenceLeave);
        assert_eq!(decoded.peer_id, peer);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_ping_pong() {
        let peer = Uuid::new_v4();
        let ping = SyncMessage::decode(&SyncMessage::ping(peer).encode().unwrap()).unwrap();
        let pong = SyncMessage::decode(&SyncMessage::pong(peer).encode().unwrap()).unwrap();
        assert_eq!(ping.msg_type, MessageType::Ping);
        assert_eq!(pong.msg_type, MessageType::Pong);
    }

    #[test]
    fn test_wrong_accessor_rejected() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(msg.presence().is_err());
        assert!(msg.response().is_err());
        assert!(msg.request_state_vector().is_err());
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }
}
