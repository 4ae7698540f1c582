//! Reconciler: the bridge between live rooms and durable storage.
//!
//! Storage holds plain block lists with no CRDT metadata, so the two
//! directions are asymmetric:
//!
//! - **Bootstrap** (storage → replica): stored blocks are replayed as
//!   updates authored by the reserved storage replica id. The encoding
//!   is deterministic, so when several parties seed the same page the
//!   duplicates suppress themselves, and any live edit outranks the
//!   seed.
//! - **Flush** (replica → storage): the room's visible, ordered block
//!   list replaces the stored one. The reconciler is the only durable
//!   writer for block content; flushes are debounced and retried, and
//!   a failed flush never blocks editing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use papyrus_core::{Block, CrdtError, DocumentReplica, ReplicaId, UpdateOp};

use crate::room::Room;
use crate::store::{PagePatch, PageStore, StoreError};

/// Reconciler errors.
#[derive(Debug)]
pub enum ReconcilerError {
    Store(StoreError),
    Crdt(CrdtError),
}

impl std::fmt::Display for ReconcilerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Crdt(e) => write!(f, "replica error: {e}"),
        }
    }
}

impl std::error::Error for ReconcilerError {}

impl From<StoreError> for ReconcilerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<CrdtError> for ReconcilerError {
    fn from(e: CrdtError) -> Self {
        Self::Crdt(e)
    }
}

/// Deterministic storage-origin updates for a stored block list.
///
/// Every caller seeding the same page produces byte-identical updates:
/// fixed origin, blocks applied in (position, id) order, Lamport clock
/// starting from zero. The storage origin also sorts below every real
/// replica, so a concurrent live edit always wins the tie-break.
pub fn seed_updates(doc_id: &str, blocks: &[Block]) -> Result<Vec<Vec<u8>>, CrdtError> {
    let mut ordered: Vec<&Block> = blocks.iter().collect();
    ordered.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));

    let mut seeder = DocumentReplica::with_id(doc_id, ReplicaId::storage());
    ordered
        .into_iter()
        .map(|block| seeder.apply_local(UpdateOp::Set(block.clone())))
        .collect()
}

/// Seed a room's replica from the stored page. Returns the number of
/// blocks seeded.
pub async fn bootstrap(store: &dyn PageStore, room: &Room) -> Result<usize, ReconcilerError> {
    let page = store.get(room.doc_id())?;
    let seeds = seed_updates(room.doc_id(), &page.blocks)?;
    let count = seeds.len();
    for seed in &seeds {
        room.apply_update(seed).await?;
    }
    Ok(count)
}

/// Flush cadence and retry policy.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Quiet interval before a dirty replica is flushed.
    pub debounce: Duration,
    /// First retry delay; doubles per attempt.
    pub retry_base: Duration,
    pub max_retries: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(300),
            retry_base: Duration::from_millis(100),
            max_retries: 3,
        }
    }
}

/// Background flusher for one room.
///
/// Subscribes to the room replica's change events; any change marks
/// the room dirty, and a debounced background task writes the current
/// block list to the store. Dropping without [`Reconciler::shutdown`]
/// abandons any unflushed changes.
pub struct Reconciler {
    store: Arc<dyn PageStore>,
    room: Arc<Room>,
    config: ReconcilerConfig,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
    flushes: Arc<AtomicU64>,
}

impl Reconciler {
    pub async fn spawn(store: Arc<dyn PageStore>, room: Arc<Room>, config: ReconcilerConfig) -> Self {
        let (dirty_tx, mut dirty_rx) = mpsc::unbounded_channel::<()>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let flushes = Arc::new(AtomicU64::new(0));

        room.with_replica(move |replica| {
            replica.observe(move |_event| {
                let _ = dirty_tx.send(());
            })
        })
        .await;

        let task_store = store.clone();
        let task_room = room.clone();
        let task_config = config.clone();
        let task_flushes = flushes.clone();

        let handle = tokio::spawn(async move {
            'run: loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        if dirty_rx.try_recv().is_ok() {
                            flush(&*task_store, &task_room, &task_config, &task_flushes).await;
                        }
                        break 'run;
                    }
                    signal = dirty_rx.recv() => {
                        match signal {
                            Some(()) => {
                                // Let a burst of edits settle, then
                                // write once. Shutdown cuts the wait
                                // short but still flushes.
                                tokio::select! {
                                    _ = tokio::time::sleep(task_config.debounce) => {
                                        while dirty_rx.try_recv().is_ok() {}
                                        flush(&*task_store, &task_room, &task_config, &task_flushes).await;
                                    }
                                    _ = &mut shutdown_rx => {
                                        flush(&*task_store, &task_room, &task_config, &task_flushes).await;
                                        break 'run;
                                    }
                                }
                            }
                            None => break 'run,
                        }
                    }
                }
            }
        });

        Self {
            store,
            room,
            config,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
            flushes,
        }
    }

    /// Write the current block list immediately, skipping the debounce.
    pub async fn flush_now(&self) -> bool {
        flush(&*self.store, &self.room, &self.config, &self.flushes).await
    }

    /// Completed flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Stop the background task, flushing any pending changes first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn flush(
    store: &dyn PageStore,
    room: &Room,
    config: &ReconcilerConfig,
    flushes: &AtomicU64,
) -> bool {
    let blocks = room.with_replica(|r| r.ordered_blocks()).await;
    let doc_id = room.doc_id();

    let mut delay = config.retry_base;
    for attempt in 0..=config.max_retries {
        match store.update(doc_id, PagePatch::blocks(blocks.clone())) {
            Ok(_) => {
                flushes.fetch_add(1, Ordering::Relaxed);
                log::debug!("flushed {} blocks for page {doc_id}", blocks.len());
                return true;
            }
            Err(StoreError::NotFound(_)) => {
                // Page deleted underneath the room; nothing to write.
                log::warn!("flush target page {doc_id} no longer exists");
                return false;
            }
            Err(e) => {
                log::warn!("flush attempt {attempt} for page {doc_id} failed: {e}");
                if attempt < config.max_retries {
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }
    log::error!("giving up flushing page {doc_id} after {} retries", config.max_retries);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::DEFAULT_PRESENCE_TIMEOUT;
    use crate::store::MemoryPageStore;
    use papyrus_core::BlockKind;
    use std::sync::atomic::AtomicUsize;

    fn set(id: &str, content: &str, position: i64) -> UpdateOp {
        UpdateOp::Set(Block::new(id, BlockKind::Text, content, position))
    }

    fn room_for(doc_id: &str) -> Arc<Room> {
        Arc::new(Room::new(doc_id, 64, DEFAULT_PRESENCE_TIMEOUT))
    }

    fn quick_config() -> ReconcilerConfig {
        ReconcilerConfig {
            debounce: Duration::from_millis(20),
            retry_base: Duration::from_millis(10),
            max_retries: 3,
        }
    }

    /// Store whose next `fail_next` updates return an I/O error.
    struct FlakyStore {
        inner: MemoryPageStore,
        fail_next: AtomicUsize,
    }

    impl FlakyStore {
        fn new(fail_next: usize) -> Self {
            Self {
                inner: MemoryPageStore::new(),
                fail_next: AtomicUsize::new(fail_next),
            }
        }
    }

    impl PageStore for FlakyStore {
        fn list(&self) -> Result<Vec<crate::store::PersistedPage>, StoreError> {
            self.inner.list()
        }
        fn get(&self, id: &str) -> Result<crate::store::PersistedPage, StoreError> {
            self.inner.get(id)
        }
        fn create(&self, title: &str) -> Result<crate::store::PersistedPage, StoreError> {
            self.inner.create(title)
        }
        fn update(&self, id: &str, patch: PagePatch) -> Result<crate::store::PersistedPage, StoreError> {
            let remaining = self.fail_next.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_next.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Io(std::io::Error::other("transient")));
            }
            self.inner.update(id, patch)
        }
        fn delete(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete(id)
        }
    }

    #[test]
    fn test_seed_updates_deterministic() {
        let blocks = vec![
            Block::new("b2", BlockKind::Code, "fn x() {}", 1),
            Block::new("b1", BlockKind::Text, "hello", 0),
        ];
        let a = seed_updates("d", &blocks).unwrap();
        // Input order must not matter.
        let reversed: Vec<Block> = blocks.iter().rev().cloned().collect();
        let b = seed_updates("d", &reversed).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_room() {
        let store = MemoryPageStore::new();
        let page = store.create("Notes").unwrap();
        store
            .update(
                &page.id,
                PagePatch::blocks(vec![
                    Block::new("b1", BlockKind::Text, "first", 0),
                    Block::new("b2", BlockKind::Text, "second", 1),
                ]),
            )
            .unwrap();

        let room = room_for(&page.id);
        let seeded = bootstrap(&store, &room).await.unwrap();
        assert_eq!(seeded, 2);

        let blocks = room.with_replica(|r| r.ordered_blocks()).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].content, "first");
        assert_eq!(blocks[1].content, "second");
    }

    #[tokio::test]
    async fn test_duplicate_seed_suppressed() {
        // A client that bootstrapped the same page locally sends its
        // seed updates to the room; the room already has them.
        let store = MemoryPageStore::new();
        let page = store.create("Notes").unwrap();

        let room = room_for(&page.id);
        bootstrap(&store, &room).await.unwrap();

        let seeds = seed_updates(&page.id, &store.get(&page.id).unwrap().blocks).unwrap();
        for seed in &seeds {
            assert!(!room.apply_update(seed).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_live_edit_outranks_seed() {
        let store = MemoryPageStore::new();
        let page = store.create("Notes").unwrap();
        let block_id = page.blocks[0].id.clone();

        let room = room_for(&page.id);

        // A peer edits the block before the room bootstraps.
        let mut peer = DocumentReplica::new(&page.id);
        let edit = peer
            .apply_local(set(&block_id, "edited while offline", 0))
            .unwrap();
        room.apply_update(&edit).await.unwrap();

        bootstrap(&store, &room).await.unwrap();
        let content = room
            .with_replica(|r| r.get(&block_id).map(|b| b.content.clone()))
            .await
            .unwrap();
        assert_eq!(content, "edited while offline");
    }

    #[tokio::test]
    async fn test_debounced_flush_coalesces_burst() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let page = store.create("Notes").unwrap();
        let room = room_for(&page.id);

        let rec = Reconciler::spawn(store.clone(), room.clone(), quick_config()).await;

        let mut peer = DocumentReplica::new(&page.id);
        for i in 0..5 {
            let u = peer.apply_local(set(&format!("b{i}"), "x", i)).unwrap();
            room.apply_update(&u).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rec.flush_count(), 1);
        assert_eq!(store.get(&page.id).unwrap().blocks.len(), 5);
        rec.shutdown().await;
    }

    #[tokio::test]
    async fn test_flush_retries_transient_failures() {
        let store: Arc<dyn PageStore> = Arc::new(FlakyStore::new(2));
        let page = store.create("Notes").unwrap();
        let room = room_for(&page.id);
        bootstrap(&*store, &room).await.unwrap();

        let rec = Reconciler::spawn(store.clone(), room.clone(), quick_config()).await;
        assert!(rec.flush_now().await);
        assert_eq!(rec.flush_count(), 1);
        rec.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let page = store.create("Notes").unwrap();
        let room = room_for(&page.id);

        let mut config = quick_config();
        // Debounce far longer than the test; only shutdown can flush.
        config.debounce = Duration::from_secs(60);
        let rec = Reconciler::spawn(store.clone(), room.clone(), config).await;

        let mut peer = DocumentReplica::new(&page.id);
        let u = peer.apply_local(set("b1", "last words", 0)).unwrap();
        room.apply_update(&u).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        rec.shutdown().await;
        let stored = store.get(&page.id).unwrap();
        assert!(stored.blocks.iter().any(|b| b.content == "last words"));
    }

    #[tokio::test]
    async fn test_flush_of_deleted_page_gives_up() {
        let store: Arc<dyn PageStore> = Arc::new(MemoryPageStore::new());
        let page = store.create("Notes").unwrap();
        let room = room_for(&page.id);
        let rec = Reconciler::spawn(store.clone(), room.clone(), quick_config()).await;

        store.delete(&page.id).unwrap();
        assert!(!rec.flush_now().await);
        rec.shutdown().await;
    }
}
