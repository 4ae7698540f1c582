//! Logical time: replica identity, Lamport stamps, state vectors.
//!
//! A state vector records, per origin replica, the highest update
//! sequence number incorporated locally. Comparing state vectors is
//! what makes duplicate suppression and minimal resync diffs work.

use std::collections::HashMap;

use serde::de::{SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Identity of one replica (one per connected peer, plus the room's
/// authoritative replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(Uuid);

impl ReplicaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The synthetic origin used when seeding a replica from durable
    /// storage. Fixed (nil UUID) so that bootstrap writes from any
    /// process compare equal, and any live edit supersedes them.
    pub fn storage() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ReplicaId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lamport stamp: totally ordered by clock, tie-broken by origin.
///
/// This is the last-writer-wins order for concurrent sets of the same
/// block id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub clock: u64,
    pub origin: ReplicaId,
}

/// Per-origin high-water marks of incorporated updates.
///
/// Serialized as a sorted `(origin, seq)` pair list so encodings are
/// deterministic (snapshots of equal state compare byte-equal).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateVector {
    seen: HashMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest seq incorporated from `origin` (0 = none).
    pub fn get(&self, origin: ReplicaId) -> u64 {
        self.seen.get(&origin).copied().unwrap_or(0)
    }

    /// Whether the update `(origin, seq)` is already reflected here.
    pub fn contains(&self, origin: ReplicaId, seq: u64) -> bool {
        self.get(origin) >= seq
    }

    /// Record `(origin, seq)` as incorporated.
    pub fn observe(&mut self, origin: ReplicaId, seq: u64) {
        let entry = self.seen.entry(origin).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &StateVector) {
        for (&origin, &seq) in &other.seen {
            self.observe(origin, seq);
        }
    }

    /// Whether every entry of `other` is covered by this vector.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other.seen.iter().all(|(&o, &s)| self.contains(o, s))
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Deterministic `(origin, seq)` pairs, sorted by origin.
    pub fn sorted_pairs(&self) -> Vec<(ReplicaId, u64)> {
        let mut pairs: Vec<_> = self.seen.iter().map(|(&o, &s)| (o, s)).collect();
        pairs.sort();
        pairs
    }

    pub fn encode(&self) -> Vec<u8> {
        // Sorted-pair encoding; cannot fail for this shape.
        bincode::serde::encode_to_vec(self, bincode::config::standard()).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, crate::error::CrdtError> {
        let (sv, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| crate::error::CrdtError::Codec(e.to_string()))?;
        Ok(sv)
    }
}

impl FromIterator<(ReplicaId, u64)> for StateVector {
    fn from_iter<T: IntoIterator<Item = (ReplicaId, u64)>>(iter: T) -> Self {
        let mut sv = StateVector::new();
        for (origin, seq) in iter {
            sv.observe(origin, seq);
        }
        sv
    }
}

impl Serialize for StateVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let pairs = self.sorted_pairs();
        let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
        for pair in pairs {
            seq.serialize_element(&pair)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for StateVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PairsVisitor;

        impl<'de> Visitor<'de> for PairsVisitor {
            type Value = StateVector;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a sequence of (replica id, seq) pairs")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut sv = StateVector::new();
                while let Some((origin, seq)) = access.next_element::<(ReplicaId, u64)>()? {
                    sv.observe(origin, seq);
                }
                Ok(sv)
            }
        }

        deserializer.deserialize_seq(PairsVisitor)
    }
}
