//! # papyrus-collab — real-time sync engine for Papyrus pages
//!
//! Connects any number of editors of one page and keeps them
//! convergent:
//!
//! ```text
//! editor UI ── ClientSyncAdapter ── SyncClient ══ ws ══ SyncServer
//!                                                           │
//!                                             RoomManager ── Room (page-<id>)
//!                                                           │        │
//!                                                      Reconciler ── PageStore
//! ```
//!
//! - [`protocol`] — the binary frame format shared by client and server
//! - [`room`] / [`server`] — room-per-document WebSocket server; the
//!   room's replica is the serialization point for its document
//! - [`client`] / [`adapter`] — client connection and the in-memory
//!   session an editor UI talks to
//! - [`presence`] — ephemeral who's-online state with timeout expiry
//! - [`store`] / [`reconciler`] — durable page catalog and the single
//!   writer that flushes replica state into it
//!
//! CRDT semantics live in [`papyrus_core`]; this crate only moves
//! encoded updates around.

pub mod adapter;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod reconciler;
pub mod room;
pub mod server;
pub mod store;

pub use adapter::ClientSyncAdapter;
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use presence::{PresenceState, PresenceTracker, DEFAULT_PRESENCE_TIMEOUT};
pub use protocol::{MessageType, ProtocolError, SyncMessage, SyncPayload, SyncResponse};
pub use reconciler::{bootstrap, seed_updates, Reconciler, ReconcilerConfig, ReconcilerError};
pub use room::{Room, RoomManager, DEFAULT_ROOM_GRACE};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use store::{JsonPageStore, MemoryPageStore, PagePatch, PageStore, PersistedPage, StoreError};
