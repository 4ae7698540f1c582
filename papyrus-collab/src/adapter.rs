//! Client-side adapter between an editor UI and the sync engine.
//!
//! Owns the local replica and the local view of room presence. Edits
//! are applied locally first and returned as encoded updates for the
//! [`crate::client::SyncClient`] to ship; remote frames flow the other
//! way. All methods are synchronous and in-memory, so the UI never
//! waits on the network.

use std::sync::Mutex;

use uuid::Uuid;

use papyrus_core::{
    Block, BlockKind, CrdtError, DocumentReplica, StateVector, UpdateOp,
};

use crate::presence::{PresenceState, PresenceTracker};
use crate::protocol::SyncPayload;
use crate::reconciler::seed_updates;

/// One user's editing session for one page.
pub struct ClientSyncAdapter {
    replica: Mutex<DocumentReplica>,
    presence: Mutex<PresenceTracker>,
    local_presence: Mutex<PresenceState>,
}

impl ClientSyncAdapter {
    /// Open a session on `doc_id` as `name`; `None` gets a generated
    /// `user<N>` name. The wire peer id is the replica's origin id.
    pub fn new(doc_id: &str, name: Option<&str>) -> Self {
        let replica = DocumentReplica::new(doc_id);
        let peer_id = replica.id().as_uuid();
        let local_presence = match name {
            Some(name) => PresenceState::new(peer_id, name),
            None => PresenceState::anonymous(peer_id),
        };
        Self {
            replica: Mutex::new(replica),
            presence: Mutex::new(PresenceTracker::default()),
            local_presence: Mutex::new(local_presence),
        }
    }

    pub fn peer_id(&self) -> Uuid {
        self.local_presence.lock().unwrap().peer_id
    }

    pub fn room(&self) -> String {
        self.replica.lock().unwrap().room().to_string()
    }

    pub fn state_vector(&self) -> StateVector {
        self.replica.lock().unwrap().state_vector()
    }

    /// Blocks in display order.
    pub fn ordered_blocks(&self) -> Vec<Block> {
        self.replica.lock().unwrap().ordered_blocks()
    }

    pub fn get_block(&self, id: &str) -> Option<Block> {
        self.replica.lock().unwrap().get(id).cloned()
    }

    // ---- Document bootstrap and remote ingestion ----

    /// Seed the session from a page loaded over REST before the room
    /// connection is up. Returns the encoded seed updates; sending
    /// them is harmless because the room produces byte-identical seeds
    /// and suppresses the duplicates.
    pub fn bootstrap_from_page(&self, blocks: &[Block]) -> Result<Vec<Vec<u8>>, CrdtError> {
        let seeds = {
            let replica = self.replica.lock().unwrap();
            seed_updates(
                papyrus_core::doc_id_of(replica.room()).unwrap_or_default(),
                blocks,
            )?
        };
        let mut replica = self.replica.lock().unwrap();
        for seed in &seeds {
            replica.apply_remote(seed)?;
        }
        Ok(seeds)
    }

    /// Apply the room's answer to our sync request.
    pub fn apply_sync(&self, payload: &SyncPayload) -> Result<(), CrdtError> {
        let mut replica = self.replica.lock().unwrap();
        match payload {
            SyncPayload::Snapshot(bytes) => replica.apply_snapshot(bytes),
            SyncPayload::Diff(updates) => {
                for update in updates {
                    replica.apply_remote(update)?;
                }
                Ok(())
            }
        }
    }

    /// Apply one remote update; `Ok(false)` for suppressed duplicates.
    pub fn apply_remote(&self, bytes: &[u8]) -> Result<bool, CrdtError> {
        self.replica.lock().unwrap().apply_remote(bytes)
    }

    // ---- Local edits ----

    /// Replace a block's text, keeping kind and position.
    pub fn edit_block_content(&self, id: &str, content: &str) -> Result<Vec<u8>, CrdtError> {
        let mut replica = self.replica.lock().unwrap();
        let mut block = replica
            .get(id)
            .cloned()
            .ok_or_else(|| CrdtError::UnknownBlock(id.to_string()))?;
        block.content = content.to_string();
        replica.apply_local(UpdateOp::Set(block))
    }

    /// Change a block's kind, resetting its content to the kind's
    /// default (switching to a table starts from an empty grid).
    pub fn change_block_kind(&self, id: &str, kind: BlockKind) -> Result<Vec<u8>, CrdtError> {
        let mut replica = self.replica.lock().unwrap();
        let mut block = replica
            .get(id)
            .cloned()
            .ok_or_else(|| CrdtError::UnknownBlock(id.to_string()))?;
        block.kind = kind;
        block.content = kind.default_content();
        replica.apply_local(UpdateOp::Set(block))
    }

    /// Insert a new block after `anchor` (or at the top for `None`).
    ///
    /// Positions stay integers: the new block takes the midpoint when
    /// a gap exists, otherwise the blocks below it are renumbered,
    /// each as its own update. Returns the new block's id and all
    /// resulting updates in apply order.
    pub fn insert_block_after(
        &self,
        anchor: Option<&str>,
        kind: BlockKind,
    ) -> Result<(String, Vec<Vec<u8>>), CrdtError> {
        let mut replica = self.replica.lock().unwrap();
        let blocks = replica.ordered_blocks();

        let insert_at = match anchor {
            Some(id) => {
                let idx = blocks
                    .iter()
                    .position(|b| b.id == id)
                    .ok_or_else(|| CrdtError::UnknownBlock(id.to_string()))?;
                idx + 1
            }
            None => 0,
        };

        let prev_pos = insert_at.checked_sub(1).map(|i| blocks[i].position);
        let next_pos = blocks.get(insert_at).map(|b| b.position);

        // Saturating arithmetic: remote peers can place blocks at the
        // i64 extremes, which `Block::validate` does not forbid.
        let (position, renumber_from) = match (prev_pos, next_pos) {
            (None, None) => (0, None),
            (Some(prev), None) => (prev.saturating_add(1), None),
            (None, Some(next)) => (next.saturating_sub(1), None),
            (Some(prev), Some(next)) => match next.checked_sub(prev) {
                Some(gap) if gap >= 2 => (prev + gap / 2, None),
                // Gap wider than i64::MAX; split the range halves.
                None => (prev / 2 + next / 2, None),
                _ => (prev.saturating_add(1), Some(insert_at)),
            },
        };

        let mut updates = Vec::new();
        let new_block = Block::new(Block::fresh_id(), kind, kind.default_content(), position);
        let new_id = new_block.id.clone();
        updates.push(replica.apply_local(UpdateOp::Set(new_block))?);

        if let Some(from) = renumber_from {
            // Shift every following block down by one, keeping the
            // total order intact.
            let mut pos = position;
            for block in &blocks[from..] {
                pos = pos.saturating_add(1);
                let mut moved = block.clone();
                moved.position = pos;
                updates.push(replica.apply_local(UpdateOp::Set(moved))?);
            }
        }

        Ok((new_id, updates))
    }

    pub fn delete_block(&self, id: &str) -> Result<Vec<u8>, CrdtError> {
        let mut replica = self.replica.lock().unwrap();
        if !replica.contains(id) {
            return Err(CrdtError::UnknownBlock(id.to_string()));
        }
        replica.apply_local(UpdateOp::Delete(id.to_string()))
    }

    // ---- Presence ----

    /// Update which block we focus; returns the presence state to
    /// send. `None` clears the focus.
    pub fn set_focus(&self, block_id: Option<&str>) -> PresenceState {
        let mut local = self.local_presence.lock().unwrap();
        local.focused_block = block_id.map(str::to_string);
        local.clone()
    }

    pub fn local_presence(&self) -> PresenceState {
        self.local_presence.lock().unwrap().clone()
    }

    /// Ingest a remote peer's presence.
    pub fn handle_presence(&self, state: PresenceState) {
        self.presence.lock().unwrap().apply(state);
    }

    pub fn handle_presence_leave(&self, peer_id: Uuid) {
        self.presence.lock().unwrap().remove(peer_id);
    }

    /// Drop peers we have not heard from within the timeout.
    pub fn expire_presence(&self) -> Vec<Uuid> {
        self.presence
            .lock()
            .unwrap()
            .expire(std::time::Instant::now())
    }

    /// Remote peers' presence in stable display order.
    pub fn presence_snapshot(&self) -> Vec<PresenceState> {
        self.presence.lock().unwrap().snapshot()
    }

    /// Names shown in the "online" indicator: us plus everyone heard
    /// from, deduplicated.
    pub fn online_users(&self) -> Vec<String> {
        let mut names = self.presence.lock().unwrap().names();
        names.push(self.local_presence.lock().unwrap().name.clone());
        names.sort();
        names.dedup();
        names
    }
}
