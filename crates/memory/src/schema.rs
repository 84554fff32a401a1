use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

/// Opaque character (NPC) identifier. Owners are isolated from each other —
/// no operation ever reads or writes a second character's tiers.
pub type CharacterId = String;

/// One atomic memory.
///
/// `id`, `content`, and `timestamp` are immutable once written except
/// through [`MemoryEntry::update_content`], which preserves both and replaces
/// only `content`/`metadata`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryEntry {
    pub id: Uuid,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl MemoryEntry {
    /// Build a fresh entry with a new id and the current timestamp.
    ///
    /// Rejects empty or whitespace-only content here — the type's only
    /// constructor — so the invariant never needs re-checking downstream.
    pub fn new(content: impl Into<String>, metadata: Map<String, Value>) -> Result<Self> {
        Self::with_timestamp(content, metadata, Utc::now())
    }

    /// Like [`MemoryEntry::new`] but accepts an explicit timestamp, used by
    /// `import` when the caller supplies one.
    pub fn with_timestamp(
        content: impl Into<String>,
        metadata: Map<String, Value>,
        timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        Ok(Self {
            id: Uuid::new_v4(),
            content,
            timestamp,
            metadata,
        })
    }

    /// Replace `content` and `metadata` in place, preserving `id` and
    /// `timestamp` (update invariant).
    pub fn update_content(&mut self, content: impl Into<String>, metadata: Map<String, Value>) -> Result<()> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MemoryError::EmptyContent);
        }
        self.content = content;
        self.metadata = metadata;
        Ok(())
    }
}
