//! Document Replica: one peer's instance of a room's shared state.
//!
//! Wraps one Block Registry, a state vector, and a bounded update
//! history. Multiple replicas of the same document exist concurrently
//! (one per connected peer plus the room's authoritative copy); none
//! is privileged — convergence, not leadership, provides consistency.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::clock::{ReplicaId, StateVector};
use crate::error::CrdtError;
use crate::ops::{Update, UpdateOp};
use crate::registry::{BlockRegistry, RegistryEvent, RegistryExport, SubscriptionId};

/// Room name for a document id: the sole identifier binding a
/// transport room to a document.
pub fn room_name(doc_id: &str) -> String {
    format!("page-{doc_id}")
}

/// Inverse of [`room_name`].
pub fn doc_id_of(room: &str) -> Option<&str> {
    room.strip_prefix("page-")
}

/// Default bound on retained update history per replica.
pub const DEFAULT_MAX_HISTORY: usize = 4096;

/// Deterministic full encoding of a replica, used to bootstrap a
/// brand-new replica instead of replaying the entire update log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    registry: RegistryExport,
    sv: StateVector,
    compacted: StateVector,
    lamport: u64,
}

/// One replica of a collaborative document.
pub struct DocumentReplica {
    id: ReplicaId,
    room: String,
    registry: BlockRegistry,
    /// Contiguous updates incorporated, per origin.
    sv: StateVector,
    /// Updates that arrived ahead of an earlier seq from their origin,
    /// held until the gap fills. The state vector only ever covers a
    /// contiguous prefix per origin, so a dropped frame keeps the
    /// vector behind it and resync still repairs the gap.
    pending: HashMap<ReplicaId, BTreeMap<u64, Update>>,
    /// Retained update log, oldest first; serves resync diffs.
    history: VecDeque<Update>,
    /// High-water mark of updates dropped from history. A diff can
    /// only be served to peers that are at least this current.
    compacted: StateVector,
    lamport: u64,
    max_history: usize,
}

impl DocumentReplica {
    /// Create a fresh replica for `doc_id` with a new identity.
    pub fn new(doc_id: &str) -> Self {
        Self::with_id(doc_id, ReplicaId::new())
    }

    pub fn with_id(doc_id: &str, id: ReplicaId) -> Self {
        Self {
            id,
            room: room_name(doc_id),
            registry: BlockRegistry::new(),
            sv: StateVector::new(),
            pending: HashMap::new(),
            history: VecDeque::new(),
            compacted: StateVector::new(),
            lamport: 0,
            max_history: DEFAULT_MAX_HISTORY,
        }
    }

    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history.max(1);
        self
    }

    pub fn id(&self) -> ReplicaId {
        self.id
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn state_vector(&self) -> StateVector {
        self.sv.clone()
    }

    pub fn registry(&self) -> &BlockRegistry {
        &self.registry
    }

    /// Register a registry change observer.
    pub fn observe(&mut self, callback: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> SubscriptionId {
        self.registry.observe(callback)
    }

    pub fn unobserve(&mut self, subscription: SubscriptionId) {
        self.registry.unobserve(subscription);
    }

    /// Apply a local mutation and return the encoded update for
    /// broadcast. The registry is mutated synchronously; broadcasting
    /// is the caller's (asynchronous) concern.
    pub fn apply_local(&mut self, op: UpdateOp) -> Result<Vec<u8>, CrdtError> {
        if let UpdateOp::Set(block) = &op {
            block.validate()?;
        }

        self.lamport += 1;
        let update = Update {
            origin: self.id,
            seq: self.sv.get(self.id) + 1,
            lamport: self.lamport,
            deps: self.sv.clone(),
            op,
        };
        let encoded = update.encode()?;
        self.incorporate(update);
        Ok(encoded)
    }

    /// Apply an encoded remote update.
    ///
    /// Returns `Ok(false)` when the update was already reflected here
    /// (replaying the same update twice is a no-op by design —
    /// required for correctness on reconnection). `Ok(true)` means it
    /// was new: incorporated immediately, or held if an earlier seq
    /// from its origin is still missing. Malformed updates are
    /// rejected whole; the registry is left untouched.
    pub fn apply_remote(&mut self, bytes: &[u8]) -> Result<bool, CrdtError> {
        let update = Update::decode(bytes)?;

        if let UpdateOp::Set(block) = &update.op {
            if let Err(e) = block.validate() {
                log::warn!("dropping out-of-schema update for {}: {e}", update.op.block_id());
                return Err(e);
            }
        }

        if self.sv.contains(update.origin, update.seq) {
            log::trace!("duplicate update {}:{} suppressed", update.origin, update.seq);
            return Ok(false);
        }

        if update.seq > self.sv.get(update.origin) + 1 {
            let origin = update.origin;
            let seq = update.seq;
            let held = self.pending.entry(origin).or_default();
            if held.insert(seq, update).is_some() {
                log::trace!("duplicate held update {origin}:{seq} suppressed");
                return Ok(false);
            }
            log::debug!("holding out-of-order update {origin}:{seq}, gap not yet filled");
            return Ok(true);
        }

        let origin = update.origin;
        self.incorporate(update);
        self.drain_pending(origin);
        Ok(true)
    }

    fn incorporate(&mut self, update: Update) {
        let stamp = update.stamp();
        match &update.op {
            UpdateOp::Set(block) => {
                self.registry
                    .apply_set(block.clone(), stamp, update.seq, update.deps.clone());
            }
            UpdateOp::Delete(id) => {
                self.registry.apply_delete(id, stamp, update.seq);
            }
        }
        self.lamport = self.lamport.max(update.lamport);
        self.sv.observe(update.origin, update.seq);
        self.history.push_back(update);
        self.trim_history();
    }

    /// Incorporate held updates from `origin` that are now contiguous.
    fn drain_pending(&mut self, origin: ReplicaId) {
        let Some(mut held) = self.pending.remove(&origin) else {
            return;
        };
        while let Some(update) = held.remove(&(self.sv.get(origin) + 1)) {
            self.incorporate(update);
        }
        if !held.is_empty() {
            self.pending.insert(origin, held);
        }
    }

    fn trim_history(&mut self) {
        let mut trimmed = false;
        while self.history.len() > self.max_history {
            if let Some(old) = self.history.pop_front() {
                self.compacted.observe(old.origin, old.seq);
                trimmed = true;
            }
        }
        if trimmed {
            self.registry.compact(&self.compacted);
        }
    }

    /// Whether a diff can be served to a peer at `remote` — false once
    /// the updates it is missing have been trimmed from history.
    pub fn can_diff(&self, remote: &StateVector) -> bool {
        remote.dominates(&self.compacted)
    }

    /// Minimal set of locally-known updates the remote side has not
    /// seen, encoded, in application order.
    pub fn diff(&self, remote: &StateVector) -> Result<Vec<Vec<u8>>, CrdtError> {
        self.history
            .iter()
            .filter(|u| !remote.contains(u.origin, u.seq))
            .map(|u| u.encode())
            .collect()
    }

    /// Deterministic full encoding of the registry and clocks.
    pub fn snapshot(&self) -> Result<Vec<u8>, CrdtError> {
        let snapshot = Snapshot {
            registry: self.registry.export(),
            sv: self.sv.clone(),
            compacted: self.sv.clone(),
            lamport: self.lamport,
        };
        bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .map_err(|e| CrdtError::Codec(e.to_string()))
    }

    /// Bootstrap this replica from a snapshot. Only valid on a replica
    /// that has not incorporated any updates yet.
    pub fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<(), CrdtError> {
        if !self.sv.is_empty() || !self.history.is_empty() {
            return Err(CrdtError::SnapshotOnNonEmpty);
        }
        let (snapshot, _): (Snapshot, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| CrdtError::Codec(e.to_string()))?;

        self.registry.import(snapshot.registry);
        self.sv = snapshot.sv;
        // Bootstrapped state has no update log behind it; diffs can
        // only be served for updates incorporated from here on.
        self.compacted = snapshot.compacted;
        self.lamport = self.lamport.max(snapshot.lamport);

        // Updates held while the replica was empty may now be covered
        // or contiguous.
        for origin in self.pending.keys().copied().collect::<Vec<_>>() {
            let covered = self.sv.get(origin);
            if let Some(held) = self.pending.get_mut(&origin) {
                held.retain(|&seq, _| seq > covered);
            }
            self.drain_pending(origin);
        }
        Ok(())
    }

    // Convenience accessors over the registry.

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.registry.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn block_count(&self) -> usize {
        self.registry.len()
    }

    pub fn ordered_blocks(&self) -> Vec<Block> {
        self.registry.ordered_blocks()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Number of out-of-order updates held waiting for a gap to fill.
    pub fn pending_updates(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }
}
