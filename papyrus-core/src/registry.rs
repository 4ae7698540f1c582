//! Block Registry: the replicated id → block map.
//!
//! Each id holds at most one winning set and one winning delete, both
//! chosen by Lamport-stamp maximum. Visibility is a pure function of
//! the pair, so merge order never matters:
//!
//! - Set vs Set: last writer wins, ties broken by origin id.
//! - Set vs Delete: the set is visible only if it causally observed
//!   the delete (its deps cover the delete's `(origin, seq)`).
//!   A concurrent set therefore loses to the delete within one merge
//!   round, while a set issued after the delete re-inserts the id.
//! - Delete vs Delete: higher stamp retained; effect is identical.
//!
//! Tombstones are not permanent: `compact` drops delete entries the
//! retained history window no longer needs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::clock::{Stamp, StateVector};

/// What a registry mutation did to visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Inserted,
    Updated,
    Removed,
}

/// Change notification delivered to observers after a mutation.
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub block_id: String,
    pub kind: EventKind,
}

/// Handle for removing a registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn Fn(&RegistryEvent) + Send + Sync>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SetEntry {
    block: Block,
    stamp: Stamp,
    seq: u64,
    deps: StateVector,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct DelEntry {
    stamp: Stamp,
    seq: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Slot {
    set: Option<SetEntry>,
    del: Option<DelEntry>,
}

/// Full registry state for snapshot encoding, sorted by id so equal
/// registries encode byte-equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryExport {
    slots: Vec<(String, Slot)>,
}

impl Slot {
    fn visible(&self) -> bool {
        match (&self.set, &self.del) {
            (Some(set), Some(del)) => set.deps.contains(del.stamp.origin, del.seq),
            (Some(_), None) => true,
            _ => false,
        }
    }

    fn visible_block(&self) -> Option<&Block> {
        if self.visible() {
            self.set.as_ref().map(|s| &s.block)
        } else {
            None
        }
    }
}

/// The replicated mapping from block id to block value.
pub struct BlockRegistry {
    slots: HashMap<String, Slot>,
    observers: Vec<(u64, Observer)>,
    next_observer: u64,
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockRegistry {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            observers: Vec::new(),
            next_observer: 0,
        }
    }

    /// Merge a set of `block` stamped by its origin.
    ///
    /// `seq` is the origin's per-update sequence number and `deps` the
    /// origin's state vector at emission. Returns whether visible
    /// state changed.
    pub fn apply_set(&mut self, block: Block, stamp: Stamp, seq: u64, deps: StateVector) -> bool {
        let id = block.id.clone();
        let slot = self.slots.entry(id.clone()).or_default();
        let before = slot.visible_block().cloned();

        let incoming = SetEntry { block, stamp, seq, deps };
        match &slot.set {
            Some(existing) if existing.stamp >= incoming.stamp => {}
            _ => slot.set = Some(incoming),
        }

        let after = slot.visible_block().cloned();
        self.emit_change(&id, before, after)
    }

    /// Merge a delete of `id` stamped by its origin.
    pub fn apply_delete(&mut self, id: &str, stamp: Stamp, seq: u64) -> bool {
        let slot = self.slots.entry(id.to_string()).or_default();
        let before = slot.visible_block().cloned();

        let incoming = DelEntry { stamp, seq };
        match &slot.del {
            Some(existing) if existing.stamp >= incoming.stamp => {}
            _ => slot.del = Some(incoming),
        }

        let after = slot.visible_block().cloned();
        self.emit_change(id, before, after)
    }

    fn emit_change(&mut self, id: &str, before: Option<Block>, after: Option<Block>) -> bool {
        let kind = match (&before, &after) {
            (None, Some(_)) => Some(EventKind::Inserted),
            (Some(_), None) => Some(EventKind::Removed),
            (Some(b), Some(a)) if b != a => Some(EventKind::Updated),
            _ => None,
        };

        match kind {
            Some(kind) => {
                let event = RegistryEvent {
                    block_id: id.to_string(),
                    kind,
                };
                for (_, observer) in &self.observers {
                    observer(&event);
                }
                true
            }
            None => false,
        }
    }

    /// Current visible `(id, block)` pairs. No ordering guarantee;
    /// callers sort by `(position, id)` for document order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &Block)> {
        self.slots
            .iter()
            .filter_map(|(id, slot)| slot.visible_block().map(|b| (id.as_str(), b)))
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.slots.get(id).and_then(|slot| slot.visible_block())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Number of visible blocks.
    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.visible()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible blocks in document order: position ascending, ties
    /// broken by id so the order is total and stable across replicas.
    pub fn ordered_blocks(&self) -> Vec<Block> {
        let mut blocks: Vec<Block> = self
            .slots
            .values()
            .filter_map(|slot| slot.visible_block().cloned())
            .collect();
        blocks.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        blocks
    }

    /// Register a change observer; fires after every visible mutation.
    pub fn observe(&mut self, callback: impl Fn(&RegistryEvent) + Send + Sync + 'static) -> SubscriptionId {
        let id = self.next_observer;
        self.next_observer += 1;
        self.observers.push((id, Box::new(callback)));
        SubscriptionId(id)
    }

    pub fn unobserve(&mut self, subscription: SubscriptionId) {
        self.observers.retain(|(id, _)| *id != subscription.0);
    }

    /// Number of ids currently carrying a delete entry.
    pub fn tombstone_count(&self) -> usize {
        self.slots.values().filter(|s| s.del.is_some()).count()
    }

    /// Export full state (live entries and tombstones) for snapshots.
    pub fn export(&self) -> RegistryExport {
        let mut slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        RegistryExport { slots }
    }

    /// Rebuild from an export; replaces all current state. Observers
    /// are not notified — callers re-render explicitly after bootstrap.
    pub fn import(&mut self, export: RegistryExport) {
        self.slots = export.slots.into_iter().collect();
    }

    /// Drop delete bookkeeping that `covered` has fully incorporated.
    ///
    /// Called when the retained history window advances: a delete every
    /// future set will have observed no longer needs to be kept, and a
    /// hidden slot whose set and delete are both covered can go whole.
    pub fn compact(&mut self, covered: &StateVector) {
        self.slots.retain(|_, slot| {
            let del_covered = slot
                .del
                .as_ref()
                .is_some_and(|d| covered.contains(d.stamp.origin, d.seq));
            if !del_covered {
                return true;
            }

            if slot.visible() {
                slot.del = None;
                return true;
            }

            let set_covered = slot
                .set
                .as_ref()
                .is_none_or(|s| covered.contains(s.stamp.origin, s.seq));
            if set_covered {
                // Hidden and fully in the past: remove the id entirely.
                false
            } else {
                true
            }
        });
    }
}
