//! Bounded per-character FIFO with a consolidated snapshot file.
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::schema::{CharacterId, MemoryEntry};

/// On-disk shape of the consolidated snapshot: character → ordered entries,
/// oldest first. Written as one unit via write-to-temp-then-rename so a
/// crash mid-write never leaves a torn file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SnapshotFile {
    characters: HashMap<CharacterId, Vec<MemoryEntry>>,
}

pub struct RecentTier {
    queues: DashMap<CharacterId, VecDeque<MemoryEntry>>,
    capacity: usize,
    snapshot_path: PathBuf,
}

impl RecentTier {
    pub fn new(capacity: usize, snapshot_path: impl Into<PathBuf>) -> Self {
        Self {
            queues: DashMap::new(),
            capacity: capacity.max(1),
            snapshot_path: snapshot_path.into(),
        }
    }

    /// Append `entry` for `char_id`. If the queue was already at capacity,
    /// the oldest entry is popped and returned to the caller (the
    /// coordinator), which is responsible for moving it into the buffer
    /// tier. Returns `None` when nothing was evicted.
    pub fn add(&self, char_id: &CharacterId, entry: MemoryEntry) -> Option<MemoryEntry> {
        let mut queue = self.queues.entry(char_id.clone()).or_default();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(entry);
        evicted
    }

    /// Entries in insertion order, oldest first.
    pub fn get(&self, char_id: &CharacterId) -> Vec<MemoryEntry> {
        self.queues
            .get(char_id)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn update(&self, char_id: &CharacterId, id: Uuid, content: &str, metadata: serde_json::Map<String, serde_json::Value>) -> Result<bool> {
        let Some(mut queue) = self.queues.get_mut(char_id) else {
            return Ok(false);
        };
        for entry in queue.iter_mut() {
            if entry.id == id {
                entry.update_content(content, metadata)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn delete(&self, char_id: &CharacterId, id: Uuid) -> bool {
        let Some(mut queue) = self.queues.get_mut(char_id) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|e| e.id != id);
        queue.len() < before
    }

    /// Remove every entry for `char_id`, returning the count removed.
    pub fn clear(&self, char_id: &CharacterId) -> usize {
        self.queues
            .remove(char_id)
            .map(|(_, q)| q.len())
            .unwrap_or(0)
    }

    pub fn len(&self, char_id: &CharacterId) -> usize {
        self.queues.get(char_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn last_timestamp(&self, char_id: &CharacterId) -> Option<chrono::DateTime<chrono::Utc>> {
        self.queues.get(char_id).and_then(|q| q.back().map(|e| e.timestamp))
    }

    /// Every character currently tracked, regardless of emptiness.
    pub fn character_ids(&self) -> Vec<CharacterId> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }

    /// Write every character's queue to `snapshot_path` as one unit.
    pub async fn snapshot_to_disk(&self) -> Result<()> {
        let mut characters = HashMap::new();
        for entry in self.queues.iter() {
            characters.insert(entry.key().clone(), entry.value().iter().cloned().collect());
        }
        let file = SnapshotFile { characters };
        let rendered = serde_json::to_vec_pretty(&file)?;

        if let Some(parent) = self.snapshot_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = tmp_sibling(&self.snapshot_path);
        let write_result: Result<()> = async {
            let mut f = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            f.write_all(&rendered).await?;
            f.flush().await?;
            f.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        tokio::fs::rename(&tmp_path, &self.snapshot_path).await?;
        Ok(())
    }

    /// Replay the persisted snapshot. A missing file restores nothing (not
    /// an error). A present-but-truncated/corrupt file restores an empty
    /// queue for the affected characters only — never aborts the whole
    /// restore.
    pub async fn restore_from_disk(&self) -> Result<()> {
        if !self.snapshot_path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read(&self.snapshot_path).await?;
        let file: SnapshotFile = match serde_json::from_slice(&raw) {
            Ok(f) => f,
            Err(err) => {
                warn!(path = %self.snapshot_path.display(), error = %err, "recent snapshot unreadable — starting with no recent entries");
                return Ok(());
            }
        };

        for (char_id, entries) in file.characters {
            let take = entries.len().min(self.capacity);
            let trimmed = if entries.len() > take {
                warn!(character = %char_id, len = entries.len(), capacity = self.capacity, "truncated snapshot exceeds capacity — keeping newest entries");
                entries[entries.len() - take..].to_vec()
            } else {
                entries
            };
            self.queues.insert(char_id, trimmed.into());
        }
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let filename = path
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "snapshot.json".to_string());
    path.with_file_name(format!("{filename}.tmp"))
}
