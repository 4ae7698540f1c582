//! Replicated update encoding.
//!
//! Every mutation of a Block Registry travels as one `Update`:
//! a set (insert or full replacement) or a delete of a single block,
//! tagged with the origin's identity, per-origin sequence number,
//! Lamport clock, and the origin's state vector at emission. Updates
//! are commutative, associative, and idempotent under registry merge.

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::clock::{ReplicaId, Stamp, StateVector};
use crate::error::CrdtError;

/// The payload of an update: one atomic write or delete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UpdateOp {
    /// Insert or fully replace one block.
    Set(Block),
    /// Remove one block id.
    Delete(String),
}

impl UpdateOp {
    /// The block id this operation targets.
    pub fn block_id(&self) -> &str {
        match self {
            UpdateOp::Set(block) => &block.id,
            UpdateOp::Delete(id) => id,
        }
    }
}

/// One replicated mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    /// Replica that authored the mutation.
    pub origin: ReplicaId,
    /// Origin-local sequence number, contiguous from 1.
    pub seq: u64,
    /// Lamport clock at emission.
    pub lamport: u64,
    /// Origin's state vector at emission; what makes delete-wins
    /// causally precise.
    pub deps: StateVector,
    pub op: UpdateOp,
}

impl Update {
    pub fn stamp(&self) -> Stamp {
        Stamp {
            clock: self.lamport,
            origin: self.origin,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CrdtError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CrdtError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CrdtError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CrdtError::Codec(e.to_string()))?;
        Ok(update)
    }
}
