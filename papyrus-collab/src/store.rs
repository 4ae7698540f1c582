//! Durable page storage behind the sync engine.
//!
//! The store holds the page catalog (title, block list, timestamps)
//! that outlives any room. It knows nothing about CRDT metadata; the
//! reconciler is its single writer for block content, converting
//! replica state into plain block lists on flush and back on
//! bootstrap. Two implementations: in-memory for tests and servers
//! that don't need durability, and one JSON file per page on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use papyrus_core::{Block, BlockKind};

/// Longest accepted page title; longer input is truncated.
pub const MAX_TITLE_LEN: usize = 200;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn normalize_title(title: &str) -> String {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return "Untitled".to_string();
    }
    trimmed.chars().take(MAX_TITLE_LEN).collect()
}

/// One stored page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPage {
    pub id: String,
    pub title: String,
    pub blocks: Vec<Block>,
    /// Milliseconds since the Unix epoch.
    pub updated_at: u64,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct PagePatch {
    pub title: Option<String>,
    pub blocks: Option<Vec<Block>>,
}

impl PagePatch {
    pub fn blocks(blocks: Vec<Block>) -> Self {
        Self {
            title: None,
            blocks: Some(blocks),
        }
    }

    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            blocks: None,
        }
    }
}

/// Storage errors.
#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    Io(std::io::Error),
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "page not found: {id}"),
            Self::Io(e) => write!(f, "storage I/O error: {e}"),
            Self::Corrupt(e) => write!(f, "corrupt page record: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Page catalog interface.
///
/// Methods are synchronous; callers on async tasks are expected to
/// treat flushes as fire-and-forget and never hold replica locks
/// across a store call.
pub trait PageStore: Send + Sync {
    /// All pages, most recently updated first.
    fn list(&self) -> Result<Vec<PersistedPage>, StoreError>;

    fn get(&self, id: &str) -> Result<PersistedPage, StoreError>;

    /// Create a page seeded with one empty text block.
    fn create(&self, title: &str) -> Result<PersistedPage, StoreError>;

    fn update(&self, id: &str, patch: PagePatch) -> Result<PersistedPage, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;
}

fn new_page(title: &str) -> PersistedPage {
    PersistedPage {
        id: Uuid::new_v4().to_string(),
        title: normalize_title(title),
        blocks: vec![Block::new(
            Block::fresh_id(),
            BlockKind::Text,
            "",
            0,
        )],
        updated_at: now_ms(),
    }
}

fn apply_patch(page: &mut PersistedPage, patch: PagePatch) {
    if let Some(title) = patch.title {
        page.title = normalize_title(&title);
    }
    if let Some(blocks) = patch.blocks {
        page.blocks = blocks;
    }
    page.updated_at = now_ms();
}

/// In-memory page store.
#[derive(Default)]
pub struct MemoryPageStore {
    pages: RwLock<HashMap<String, PersistedPage>>,
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PageStore for MemoryPageStore {
    fn list(&self) -> Result<Vec<PersistedPage>, StoreError> {
        let pages = self.pages.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<PersistedPage> = pages.values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn get(&self, id: &str) -> Result<PersistedPage, StoreError> {
        self.pages
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn create(&self, title: &str) -> Result<PersistedPage, StoreError> {
        let page = new_page(title);
        self.pages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(page.id.clone(), page.clone());
        Ok(page)
    }

    fn update(&self, id: &str, patch: PagePatch) -> Result<PersistedPage, StoreError> {
        let mut pages = self.pages.write().unwrap_or_else(|e| e.into_inner());
        let page = pages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        apply_patch(page, patch);
        Ok(page.clone())
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.pages
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}

/// One JSON file per page under a root directory.
///
/// Writes go to a temp file first and are renamed into place, so a
/// crashed flush never leaves a half-written page behind.
pub struct JsonPageStore {
    root: PathBuf,
}

impl JsonPageStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn page_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    fn read_page(&self, path: &Path) -> Result<PersistedPage, StoreError> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt(e.to_string()))
    }

    fn write_page(&self, page: &PersistedPage) -> Result<(), StoreError> {
        let bytes =
            serde_json::to_vec_pretty(page).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let path = self.page_path(&page.id);
        let tmp = self.root.join(format!("{}.json.tmp", page.id));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

impl PageStore for JsonPageStore {
    fn list(&self) -> Result<Vec<PersistedPage>, StoreError> {
        let mut all = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_page(&path) {
                Ok(page) => all.push(page),
                Err(e) => log::warn!("skipping unreadable page file {path:?}: {e}"),
            }
        }
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn get(&self, id: &str) -> Result<PersistedPage, StoreError> {
        let path = self.page_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        self.read_page(&path)
    }

    fn create(&self, title: &str) -> Result<PersistedPage, StoreError> {
        let page = new_page(title);
        self.write_page(&page)?;
        Ok(page)
    }

    fn update(&self, id: &str, patch: PagePatch) -> Result<PersistedPage, StoreError> {
        let mut page = self.get(id)?;
        apply_patch(&mut page, patch);
        self.write_page(&page)?;
        Ok(page)
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.page_path(id);
        if !path.exists() {
            return Err(StoreError::NotFound(id.to_string()));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_store(store: &dyn PageStore) {
        // Creation seeds one empty text block at position 0.
        let page = store.create("My Notes").unwrap();
        assert_eq!(page.title, "My Notes");
        assert_eq!(page.blocks.len(), 1);
        assert_eq!(page.blocks[0].kind, BlockKind::Text);
        assert_eq!(page.blocks[0].content, "");
        assert_eq!(page.blocks[0].position, 0);

        let fetched = store.get(&page.id).unwrap();
        assert_eq!(fetched.title, "My Notes");

        // Patch semantics: untouched fields survive.
        let updated = store
            .update(&page.id, PagePatch::title("Renamed"))
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.blocks.len(), 1);

        let blocks = vec![
            Block::new("b1", BlockKind::Text, "hello", 0),
            Block::new("b2", BlockKind::Code, "fn main() {}", 1),
        ];
        let updated = store
            .update(&page.id, PagePatch::blocks(blocks))
            .unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.blocks.len(), 2);

        store.delete(&page.id).unwrap();
        assert!(matches!(store.get(&page.id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&page.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_memory_store_crud() {
        check_store(&MemoryPageStore::new());
    }

    #[test]
    fn test_json_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        check_store(&JsonPageStore::open(dir.path()).unwrap());
    }

    #[test]
    fn test_title_normalization() {
        let store = MemoryPageStore::new();
        assert_eq!(store.create("  padded  ").unwrap().title, "padded");
        assert_eq!(store.create("").unwrap().title, "Untitled");
        assert_eq!(store.create("   ").unwrap().title, "Untitled");

        let long = "x".repeat(500);
        assert_eq!(store.create(&long).unwrap().title.len(), MAX_TITLE_LEN);
    }

    #[test]
    fn test_list_most_recent_first() {
        let store = MemoryPageStore::new();
        let a = store.create("a").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = store.create("b").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.update(&a.id, PagePatch::title("a2")).unwrap();

        let titles: Vec<String> = store.list().unwrap().into_iter().map(|p| p.title).collect();
        assert_eq!(titles, vec!["a2".to_string(), "b".to_string()]);
        let _ = b;
    }

    #[test]
    fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = JsonPageStore::open(dir.path()).unwrap();
            store.create("Durable").unwrap().id
        };

        let store = JsonPageStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&id).unwrap().title, "Durable");
    }

    #[test]
    fn test_json_store_skips_corrupt_files_on_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonPageStore::open(dir.path()).unwrap();
        store.create("ok").unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();

        let pages = store.list().unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].title, "ok");
    }
}
