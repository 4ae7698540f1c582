//! # papyrus-core — CRDT document model for Papyrus
//!
//! A page is a replicated map from block id to block value. Concurrent
//! edits from any number of peers merge deterministically without a
//! coordinator:
//!
//! - **Sets** are last-writer-wins per block id (Lamport clock,
//!   tie-broken by origin).
//! - **Deletes** win over concurrent sets within one merge round; a
//!   set issued after the delete is observed re-inserts the id.
//! - Replaying any update is a no-op (state-vector duplicate
//!   suppression), which is what makes reconnection safe.
//!
//! ## Modules
//!
//! - [`block`] — block data model (`text` / `table` / `code`)
//! - [`clock`] — replica identity, Lamport stamps, state vectors
//! - [`ops`] — the replicated update encoding
//! - [`registry`] — the id → block LWW map with change observers
//! - [`replica`] — per-peer document replica: local/remote apply,
//!   resync diffs, snapshots

pub mod block;
pub mod clock;
pub mod error;
pub mod ops;
pub mod registry;
pub mod replica;

pub use block::{Block, BlockKind, TableGrid};
pub use clock::{ReplicaId, Stamp, StateVector};
pub use error::CrdtError;
pub use ops::{Update, UpdateOp};
pub use registry::{BlockRegistry, EventKind, RegistryEvent, SubscriptionId};
pub use replica::{doc_id_of, room_name, DocumentReplica, DEFAULT_MAX_HISTORY};

/// Result type for CRDT operations.
pub type Result<T> = std::result::Result<T, CrdtError>;
