//! Error type for the CRDT engine.

/// Errors from registry/replica operations.
///
/// Malformed input never corrupts a registry: a `Codec` or
/// `InvalidBlock` error means the offending update was dropped whole.
#[derive(Debug, Clone)]
pub enum CrdtError {
    /// Update or snapshot bytes failed to decode.
    Codec(String),
    /// A block failed schema validation at the boundary.
    InvalidBlock(String),
    /// Snapshot applied to a replica that already has history.
    SnapshotOnNonEmpty,
    /// Operation referenced a block id not present in the registry.
    UnknownBlock(String),
}

impl std::fmt::Display for CrdtError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::InvalidBlock(e) => write!(f, "invalid block: {e}"),
            Self::SnapshotOnNonEmpty => write!(f, "snapshot applied to non-empty replica"),
            Self::UnknownBlock(id) => write!(f, "unknown block: {id}"),
        }
    }
}

impl std::error::Error for CrdtError {}
