//! Stored document model

use serde_json::{Map, Value};

/// A stored document: the user-visible body plus extended attributes.
///
/// A document without a body is a tombstone. Tombstones keep their
/// extended attributes, which is how staged inserts exist before they
/// become visible.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// User-visible body; `None` marks a tombstone.
    pub body: Option<Value>,
    /// Extended attributes, invisible to plain reads.
    pub xattrs: Map<String, Value>,
    /// Current CAS token.
    pub cas: u64,
}

impl Document {
    /// Whether this document is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.body.is_none()
    }
}
