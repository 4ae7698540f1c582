//! Block data model: the atomic unit of a collaborative page.
//!
//! A page is a flat set of blocks; display order comes from the
//! `position` attribute, not from a separate sequence structure.
//! Reordering a block is therefore just another block update.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CrdtError;

/// Closed set of block kinds.
///
/// Serialized lowercase so the persisted page format round-trips
/// exactly (`"text" | "table" | "code"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Text,
    Table,
    Code,
}

impl BlockKind {
    /// Default content for a freshly created block of this kind.
    ///
    /// Tables start as an empty 2×2 grid; text and code start empty.
    pub fn default_content(&self) -> String {
        match self {
            BlockKind::Table => TableGrid::default().encode(),
            BlockKind::Text | BlockKind::Code => String::new(),
        }
    }
}

/// One content block of a page.
///
/// `id` is creator-assigned, globally unique per document, and never
/// reused. `content` is an opaque string payload; for `Table` blocks
/// it is a JSON-encoded [`TableGrid`]. `position` is advisory display
/// order — equal positions are tie-broken by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(alias = "type")]
    pub kind: BlockKind,
    pub content: String,
    pub position: i64,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind, content: impl Into<String>, position: i64) -> Self {
        Self {
            id: id.into(),
            kind,
            content: content.into(),
            position,
        }
    }

    /// Allocate a fresh, collision-safe block id.
    pub fn fresh_id() -> String {
        format!("block-{}", Uuid::new_v4())
    }

    /// Validate the block at the replication boundary.
    ///
    /// Rejects empty ids and table blocks whose content is not a
    /// well-formed grid. Out-of-schema blocks are never admitted into
    /// a registry.
    pub fn validate(&self) -> Result<(), CrdtError> {
        if self.id.is_empty() {
            return Err(CrdtError::InvalidBlock("empty block id".to_string()));
        }
        if self.kind == BlockKind::Table {
            TableGrid::parse(&self.content)?;
        }
        Ok(())
    }
}

/// 2-D grid payload for table blocks.
///
/// Wire/persisted shape is `{"rows":[["a","b"],["c","d"]]}` and must
/// round-trip exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableGrid {
    pub rows: Vec<Vec<String>>,
}

impl TableGrid {
    /// Parse a table payload, rejecting anything but the fixed schema.
    pub fn parse(content: &str) -> Result<Self, CrdtError> {
        serde_json::from_str(content)
            .map_err(|e| CrdtError::InvalidBlock(format!("malformed table grid: {e}")))
    }

    /// Encode back to the canonical JSON payload.
    pub fn encode(&self) -> String {
        // Fixed schema of strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"rows":[]}"#.to_string())
    }
}

impl Default for TableGrid {
    fn default() -> Self {
        Self {
            rows: vec![
                vec![String::new(), String::new()],
                vec![String::new(), String::new()],
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_kind_lowercase_serde() {
        assert_eq!(serde_json::to_string(&BlockKind::Text).unwrap(), "\"text\"");
        assert_eq!(serde_json::to_string(&BlockKind::Table).unwrap(), "\"table\"");
        assert_eq!(serde_json::to_string(&BlockKind::Code).unwrap(), "\"code\"");

        let kind: BlockKind = serde_json::from_str("\"table\"").unwrap();
        assert_eq!(kind, BlockKind::Table);
    }

    #[test]
    fn test_fresh_id_unique_and_prefixed() {
        let a = Block::fresh_id();
        let b = Block::fresh_id();
        assert!(a.starts_with("block-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_validate_rejects_empty_id() {
        let block = Block::new("", BlockKind::Text, "hello", 0);
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_malformed_table() {
        let block = Block::new("b1", BlockKind::Table, "not json", 0);
        assert!(block.validate().is_err());

        let block = Block::new("b1", BlockKind::Table, r#"{"cols":[]}"#, 0);
        assert!(block.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_table_grid() {
        let block = Block::new("b1", BlockKind::Table, r#"{"rows":[["",""],["",""]]}"#, 0);
        assert!(block.validate().is_ok());
    }

    #[test]
    fn test_table_grid_roundtrip() {
        let raw = r#"{"rows":[["a","b"],["c","d"]]}"#;
        let grid = TableGrid::parse(raw).unwrap();
        assert_eq!(grid.rows.len(), 2);
        assert_eq!(grid.rows[0][1], "b");
        assert_eq!(grid.encode(), raw);
    }

    #[test]
    fn test_default_table_content_is_2x2() {
        let content = BlockKind::Table.default_content();
        assert_eq!(content, r#"{"rows":[["",""],["",""]]}"#);
        let grid = TableGrid::parse(&content).unwrap();
        assert_eq!(grid.rows.len(), 2);
    }

    #[test]
    fn test_block_deserializes_legacy_type_field() {
        // Persisted pages from the record store use "type" for the kind.
        let json = r#"{"id":"b1","type":"code","content":"fn main() {}","position":3}"#;
        let block: Block = serde_json::from_str(json).unwrap();
        assert_eq!(block.kind, BlockKind::Code);
        assert_eq!(block.position, 3);
    }
}
