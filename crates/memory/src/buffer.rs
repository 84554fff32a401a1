//! Per-character staging tier: entries accumulate here after recent-tier
//! eviction until there are enough to embed as a batch.
//!
//! Each character gets one JSON array file, rewritten in full on every
//! mutation via write-to-temp-then-rename, the same discipline
//! [`crate::recent::RecentTier`] uses for its snapshot.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::schema::{CharacterId, MemoryEntry};

#[derive(Debug, Default, Serialize, Deserialize)]
struct BufferFile {
    entries: Vec<MemoryEntry>,
}

pub struct BufferTier {
    dir: PathBuf,
    threshold: usize,
    /// Guards the read-modify-write cycle per character so two concurrent
    /// `add`s for the same character can't race on the same file. The
    /// coordinator already serializes writes per character, but the buffer
    /// also needs to protect its own embed/commit two-step against a
    /// crash landing between them.
    locks: dashmap::DashMap<CharacterId, std::sync::Arc<Mutex<()>>>,
}

impl BufferTier {
    pub fn new(dir: impl Into<PathBuf>, threshold: usize) -> Self {
        Self {
            dir: dir.into(),
            threshold: threshold.max(1),
            locks: dashmap::DashMap::new(),
        }
    }

    fn lock_for(&self, char_id: &CharacterId) -> std::sync::Arc<Mutex<()>> {
        std::sync::Arc::clone(&*self.locks.entry(char_id.clone()).or_insert_with(|| std::sync::Arc::new(Mutex::new(()))))
    }

    fn path_for(&self, char_id: &CharacterId) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize_filename(char_id)))
    }

    async fn read(&self, char_id: &CharacterId) -> anyhow::Result<BufferFile> {
        let path = self.path_for(char_id);
        if !path.exists() {
            return Ok(BufferFile::default());
        }
        let raw = tokio::fs::read(&path).await?;
        match serde_json::from_slice(&raw) {
            Ok(file) => Ok(file),
            Err(err) => {
                warn!(character = %char_id, path = %path.display(), error = %err, "buffer file unreadable — treating as empty");
                Ok(BufferFile::default())
            }
        }
    }

    async fn write(&self, char_id: &CharacterId, file: &BufferFile) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(char_id);
        let rendered = serde_json::to_vec_pretty(file)?;
        let tmp_path = path.with_extension("json.tmp");

        let result: anyhow::Result<()> = async {
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

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }
        tokio::fs::rename(&tmp_path, &path).await?;
        Ok(())
    }

    /// Append `entry`. Returns `true` when the buffer has now reached the
    /// embed threshold and the coordinator should run the embed procedure.
    pub async fn add(&self, char_id: &CharacterId, entry: MemoryEntry) -> Result<bool> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let mut file = self.read(char_id).await?;
        file.entries.push(entry);
        let reached = file.entries.len() >= self.threshold;
        self.write(char_id, &file).await?;
        Ok(reached)
    }

    pub async fn contents(&self, char_id: &CharacterId) -> Result<Vec<MemoryEntry>> {
        Ok(self.read(char_id).await?.entries)
    }

    pub async fn len(&self, char_id: &CharacterId) -> Result<usize> {
        Ok(self.read(char_id).await?.entries.len())
    }

    pub async fn update(&self, char_id: &CharacterId, id: Uuid, content: &str, metadata: serde_json::Map<String, serde_json::Value>) -> Result<bool> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let mut file = self.read(char_id).await?;
        let Some(entry) = file.entries.iter_mut().find(|e| e.id == id) else {
            return Ok(false);
        };
        entry.update_content(content, metadata)?;
        self.write(char_id, &file).await?;
        Ok(true)
    }

    pub async fn delete(&self, char_id: &CharacterId, id: Uuid) -> Result<bool> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let mut file = self.read(char_id).await?;
        let before = file.entries.len();
        file.entries.retain(|e| e.id != id);
        let removed = file.entries.len() < before;
        if removed {
            self.write(char_id, &file).await?;
        }
        Ok(removed)
    }

    /// Remove the character's staging file entirely (not just truncate it),
    /// so no orphan file remains under `buffer_dir` once cleared.
    pub async fn clear(&self, char_id: &CharacterId) -> Result<usize> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let file = self.read(char_id).await?;
        let count = file.entries.len();
        let path = self.path_for(char_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(anyhow::Error::from)?;
        }
        self.locks.remove(char_id);
        Ok(count)
    }

    /// Remove exactly the entries named by `ids` (the ones the coordinator
    /// has just embedded and durably written into the vector index).
    /// Idempotent: ids already absent are silently skipped, so retrying
    /// after a crash between "index write" and "buffer commit" is safe.
    pub async fn remove_embedded(&self, char_id: &CharacterId, ids: &[Uuid]) -> Result<()> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let mut file = self.read(char_id).await?;
        file.entries.retain(|e| !ids.contains(&e.id));
        self.write(char_id, &file).await?;
        Ok(())
    }

    pub fn character_files(&self) -> anyhow::Result<Vec<CharacterId>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem() {
                if entry.path().extension().map(|e| e == "json").unwrap_or(false) {
                    out.push(stem.to_string_lossy().to_string());
                }
            }
        }
        Ok(out)
    }
}

fn sanitize_filename(character: &str) -> String {
    character
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn entry(content: &str) -> MemoryEntry {
        MemoryEntry::new(content, Map::new()).unwrap()
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("npc-memory-buffer-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn add_signals_threshold_reached() -> Result<()> {
        let dir = temp_dir();
        let tier = BufferTier::new(&dir, 3);
        let char_id = "c".to_string();
        assert!(!tier.add(&char_id, entry("one")).await?);
        assert!(!tier.add(&char_id, entry("two")).await?);
        assert!(tier.add(&char_id, entry("three")).await?);
        assert_eq!(tier.len(&char_id).await?, 3);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn remove_embedded_is_idempotent() -> Result<()> {
        let dir = temp_dir();
        let tier = BufferTier::new(&dir, 10);
        let char_id = "c".to_string();
        let e1 = entry("one");
        let e2 = entry("two");
        let id1 = e1.id;
        tier.add(&char_id, e1).await?;
        tier.add(&char_id, e2).await?;

        tier.remove_embedded(&char_id, &[id1]).await?;
        assert_eq!(tier.len(&char_id).await?, 1);

        // Retrying with the same id (simulating a crash-recovery replay) is a no-op.
        tier.remove_embedded(&char_id, &[id1]).await?;
        assert_eq!(tier.len(&char_id).await?, 1);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn persists_across_reopen() -> Result<()> {
        let dir = temp_dir();
        let char_id = "c".to_string();
        {
            let tier = BufferTier::new(&dir, 10);
            tier.add(&char_id, entry("persisted")).await?;
        }
        let tier = BufferTier::new(&dir, 10);
        let contents = tier.contents(&char_id).await?;
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0].content, "persisted");

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
