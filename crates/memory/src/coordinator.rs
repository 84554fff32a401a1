//! Coordinator: wires the three tiers and the embedding engine together and
//! is the crate's only public entry point. Every operation that touches a
//! character's storage is serialized per-character via a `DashMap` of lock
//! handles, so one character's writer never blocks another's.
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use npc_memory_config::MemoryServiceConfig;

use crate::buffer::BufferTier;
use crate::embedding::EmbeddingEngine;
use crate::error::{MemoryError, Result};
use crate::recent::RecentTier;
use crate::schema::{CharacterId, MemoryEntry};
use crate::vector_index::{ScoredEntry, VectorIndexRegistry};

/// A relevant memory surfaced by `search`/`get_context`, with its score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub entry: MemoryEntry,
    pub score: f32,
}

impl From<ScoredEntry> for ScoredMemory {
    fn from(s: ScoredEntry) -> Self {
        Self { entry: s.entry, score: s.score }
    }
}

/// Combined recent + relevant view for prompt assembly, used by
/// `get_context`. Callers decide whether and how to dedup the two lists —
/// this crate does not, since only the caller knows how the result will be
/// rendered into a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    pub recent: Vec<MemoryEntry>,
    pub relevant: Vec<ScoredMemory>,
}

/// Full per-character dump for backup/migration (`export`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterExport {
    pub character: CharacterId,
    pub recent: Vec<MemoryEntry>,
    pub buffered: Vec<MemoryEntry>,
    pub indexed: Vec<MemoryEntry>,
}

/// Per-character counts across all three tiers plus the most recent insert,
/// returned by `list_characters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub character: CharacterId,
    pub recent_count: usize,
    pub buffer_count: usize,
    pub longterm_count: usize,
    pub last_insert: Option<chrono::DateTime<chrono::Utc>>,
}

/// Result of a single `add`, reporting where the entry landed and whether
/// it triggered an eviction and/or an auto-embed along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddResult {
    pub id: Uuid,
    pub stored_in: MemoryLocation,
    pub evicted_to_buffer: bool,
    pub buffer_auto_embedded: bool,
}

/// Per-tier removal counts returned by `clear`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearCounts {
    pub recent_deleted: usize,
    pub buffer_deleted: usize,
    pub longterm_deleted: usize,
}

/// Which tier an `update`/`delete` found and mutated the entry in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLocation {
    Recent,
    Buffer,
    LongTerm,
}

impl std::fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Recent => "recent",
            Self::Buffer => "buffer",
            Self::LongTerm => "longterm",
        };
        f.write_str(s)
    }
}

pub struct MemoryCoordinator {
    recent: RecentTier,
    buffer: BufferTier,
    vectors: VectorIndexRegistry,
    embeddings: Arc<EmbeddingEngine>,
    locks: DashMap<CharacterId, Arc<Mutex<()>>>,
    default_search_k: usize,
    preload_embeddings: bool,
    max_embed_batch: usize,
}

impl MemoryCoordinator {
    pub fn new(config: &MemoryServiceConfig) -> Self {
        let recent = RecentTier::new(config.tiers.recent_capacity, normalize(&config.storage.recent_snapshot_path));
        let buffer = BufferTier::new(normalize(&config.storage.buffer_dir), config.tiers.buffer_threshold);
        let vectors = VectorIndexRegistry::new(normalize(&config.storage.vector_store_dir));
        let embeddings = Arc::new(EmbeddingEngine::new(config.embedding.backend));

        Self {
            recent,
            buffer,
            vectors,
            embeddings,
            locks: DashMap::new(),
            default_search_k: config.tiers.default_search_k.max(1),
            preload_embeddings: config.embedding.preload,
            max_embed_batch: config.embedding.max_embed_batch.max(1),
        }
    }

    fn lock_for(&self, char_id: &CharacterId) -> Arc<Mutex<()>> {
        Arc::clone(&*self.locks.entry(char_id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))))
    }

    /// Restore the recent-tier snapshot and, if configured, warm up the
    /// embedding engine up front instead of on first use.
    pub async fn startup(&self) -> Result<()> {
        self.recent.restore_from_disk().await.map_err(MemoryError::StorageFailure)?;
        if self.preload_embeddings {
            self.embeddings.warmup().await?;
        }
        info!(characters = self.recent.character_ids().len(), "memory coordinator started");
        Ok(())
    }

    /// Flush the recent-tier snapshot. Buffer and vector-index state are
    /// already durable after every mutating call, so there is nothing else
    /// to flush here.
    pub async fn shutdown(&self) -> Result<()> {
        self.recent.snapshot_to_disk().await.map_err(MemoryError::StorageFailure)?;
        info!("memory coordinator shut down cleanly");
        Ok(())
    }

    pub async fn add(&self, char_id: &CharacterId, content: &str, metadata: serde_json::Map<String, serde_json::Value>) -> Result<AddResult> {
        let entry = MemoryEntry::new(content, metadata)?;
        let id = entry.id;
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        let (evicted_to_buffer, buffer_auto_embedded) = self.ingest_locked(char_id, entry).await?;
        Ok(AddResult {
            id,
            stored_in: MemoryLocation::Recent,
            evicted_to_buffer,
            buffer_auto_embedded,
        })
    }

    /// Insert an already-constructed entry (preserving its id/timestamp)
    /// through the normal recent → buffer → embed pipeline. Used by `add`
    /// and by `import`, both under the per-character lock. Returns
    /// `(evicted_to_buffer, buffer_auto_embedded)`.
    async fn ingest_locked(&self, char_id: &CharacterId, entry: MemoryEntry) -> Result<(bool, bool)> {
        let evicted = self.recent.add(char_id, entry);
        let Some(evicted) = evicted else {
            return Ok((false, false));
        };
        let id = evicted.id;
        let reached = self.buffer.add(char_id, evicted).await?;
        info!(character = %char_id, id = %id, tier = "buffer", "entry moved from recent to buffer");
        if reached {
            let embedded = self.embed_procedure(char_id).await?;
            info!(character = %char_id, count = embedded, tier = "vector_index", "buffer threshold reached, entries embedded");
        }
        Ok((true, reached))
    }

    /// Embed every entry currently staged in the buffer and move it into
    /// the vector index. Four-step procedure: (1) read the buffer, (2)
    /// embed the batch, (3) write each entry+vector into the index, (4)
    /// remove the embedded ids from the buffer. Steps 3 and 4 are
    /// idempotent individually — if the process crashes between them, a
    /// retry re-embeds nothing new (the buffer still holds exactly the
    /// same ids) and `VectorIndex::add` simply overwrites identical rows.
    ///
    /// The buffer can hold more than `buffer_threshold` entries at once —
    /// `force_embed` on a buffer that grew past `B` while embeddings were
    /// unavailable, for instance — so entries are embedded in chunks of at
    /// most `max_embed_batch`, each chunk committed to the index and cleared
    /// from the buffer before the next chunk is embedded.
    async fn embed_procedure(&self, char_id: &CharacterId) -> Result<usize> {
        let staged = self.buffer.contents(char_id).await?;
        if staged.is_empty() {
            return Ok(0);
        }

        let index = self.vectors.get(char_id).await.map_err(MemoryError::StorageFailure)?;
        let mut total = 0;
        for chunk in staged.chunks(self.max_embed_batch) {
            let texts: Vec<String> = chunk.iter().map(|e| e.content.clone()).collect();
            let vectors = self.embeddings.embed_many(&texts).await?;

            let mut ids = Vec::with_capacity(chunk.len());
            for (entry, vector) in chunk.iter().zip(vectors.into_iter()) {
                ids.push(entry.id);
                index.add(entry.clone(), vector).map_err(MemoryError::StorageFailure)?;
            }

            self.buffer.remove_embedded(char_id, &ids).await?;
            total += ids.len();
        }
        Ok(total)
    }

    /// Run the embed procedure regardless of whether the buffer has
    /// reached its threshold (`force_embed`).
    pub async fn force_embed(&self, char_id: &CharacterId) -> Result<usize> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;
        self.embed_procedure(char_id).await
    }

    pub async fn get_recent(&self, char_id: &CharacterId) -> Vec<MemoryEntry> {
        self.recent.get(char_id)
    }

    pub async fn search(&self, char_id: &CharacterId, query: &str, k: Option<usize>) -> Result<Vec<ScoredMemory>> {
        let Some(index) = self.vectors.get_existing(char_id).await.map_err(MemoryError::StorageFailure)? else {
            return Ok(Vec::new());
        };
        let vector = self.embeddings.embed_one(query).await?;
        let k = k.unwrap_or(self.default_search_k);
        let hits = index.query(&vector, k).map_err(MemoryError::StorageFailure)?;
        Ok(hits.into_iter().map(ScoredMemory::from).collect())
    }

    /// `query` is optional: recent is always fetched, relevant only when a
    /// query is given (empty query text is treated as "no query").
    pub async fn get_context(&self, char_id: &CharacterId, query: Option<&str>, k: Option<usize>) -> Result<ContextBundle> {
        let recent = self.get_recent(char_id).await;
        let relevant = match query {
            Some(query) => self.search(char_id, query, k).await?,
            None => Vec::new(),
        };
        Ok(ContextBundle { recent, relevant })
    }

    /// Update content/metadata wherever the entry currently lives, returning
    /// which tier it was found in. Entries in the vector index are
    /// re-embedded so their vector stays consistent with the new content
    /// (update invariant).
    pub async fn update(&self, char_id: &CharacterId, id: Uuid, content: &str, metadata: serde_json::Map<String, serde_json::Value>) -> Result<MemoryLocation> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;

        if self.recent.update(char_id, id, content, metadata.clone())? {
            return Ok(MemoryLocation::Recent);
        }
        if self.buffer.update(char_id, id, content, metadata.clone()).await? {
            return Ok(MemoryLocation::Buffer);
        }

        if let Some(index) = self.vectors.get_existing(char_id).await.map_err(MemoryError::StorageFailure)? {
            if index.contains(id).map_err(MemoryError::StorageFailure)? {
                let new_vector = self.embeddings.embed_one(content).await?;
                index.update(id, content, metadata, Some(new_vector))?;
                return Ok(MemoryLocation::LongTerm);
            }
        }

        Err(MemoryError::NotFound { character: char_id.clone(), id: id.to_string() })
    }

    /// Delete wherever the entry currently lives, returning which tier it
    /// was found in.
    pub async fn delete(&self, char_id: &CharacterId, id: Uuid) -> Result<MemoryLocation> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;

        if self.recent.delete(char_id, id) {
            return Ok(MemoryLocation::Recent);
        }
        if self.buffer.delete(char_id, id).await? {
            return Ok(MemoryLocation::Buffer);
        }
        if let Some(index) = self.vectors.get_existing(char_id).await.map_err(MemoryError::StorageFailure)? {
            if index.delete(id).map_err(MemoryError::StorageFailure)? {
                return Ok(MemoryLocation::LongTerm);
            }
        }
        Err(MemoryError::NotFound { character: char_id.clone(), id: id.to_string() })
    }

    /// Erase every tier for one character, returning the count removed from
    /// each. Leaves other characters untouched (isolation invariant).
    pub async fn clear(&self, char_id: &CharacterId) -> Result<ClearCounts> {
        let lock = self.lock_for(char_id);
        let _guard = lock.lock().await;

        let recent_deleted = self.recent.clear(char_id);
        let buffer_deleted = self.buffer.clear(char_id).await?;
        let longterm_deleted = self.vectors.clear_character(char_id).await.map_err(MemoryError::StorageFailure)?;
        info!(character = %char_id, recent_deleted, buffer_deleted, longterm_deleted, "cleared all tiers");
        Ok(ClearCounts { recent_deleted, buffer_deleted, longterm_deleted })
    }

    /// Every character with memory in any tier, with per-tier counts and the
    /// most recent insert timestamp seen in the recent tier.
    pub async fn list_characters(&self) -> Result<Vec<CharacterSummary>> {
        let mut ids: std::collections::BTreeSet<CharacterId> = self.recent.character_ids().into_iter().collect();
        if let Ok(files) = self.buffer.character_files() {
            ids.extend(files);
        }
        ids.extend(self.vectors.character_ids().await);

        let mut summaries = Vec::with_capacity(ids.len());
        for character in ids {
            let buffer_count = self.buffer.len(&character).await?;
            let longterm_count = match self.vectors.get_existing(&character).await.map_err(MemoryError::StorageFailure)? {
                Some(index) => index.len().map_err(MemoryError::StorageFailure)?,
                None => 0,
            };
            summaries.push(CharacterSummary {
                recent_count: self.recent.len(&character),
                buffer_count,
                longterm_count,
                last_insert: self.recent.last_timestamp(&character),
                character,
            });
        }
        Ok(summaries)
    }

    pub async fn export(&self, char_id: &CharacterId) -> Result<CharacterExport> {
        let indexed = match self.vectors.get_existing(char_id).await.map_err(MemoryError::StorageFailure)? {
            Some(index) => index.get_all().map_err(MemoryError::StorageFailure)?,
            None => Vec::new(),
        };
        Ok(CharacterExport {
            character: char_id.clone(),
            recent: self.recent.get(char_id),
            buffered: self.buffer.contents(char_id).await?,
            indexed,
        })
    }

    /// Replay a previously exported bundle as a sequence of fresh `add`s:
    /// each entry gets a newly generated id (ids are never reused across an
    /// export/import round trip) while its original timestamp is preserved,
    /// and re-enters through the normal recent → buffer → embed pipeline, so
    /// capacity and threshold rules apply exactly as if each entry had just
    /// been added in export order. Concurrent imports for the same character
    /// serialize on the same per-character lock as any other write — no
    /// separate import-specific locking is needed.
    pub async fn import(&self, export: CharacterExport) -> Result<()> {
        let lock = self.lock_for(&export.character);
        let _guard = lock.lock().await;

        let mut all = export.recent;
        all.extend(export.buffered);
        all.extend(export.indexed);
        all.sort_by_key(|e| e.timestamp);

        for entry in all {
            let fresh = MemoryEntry::with_timestamp(entry.content, entry.metadata, entry.timestamp)?;
            self.ingest_locked(&export.character, fresh).await?;
        }
        Ok(())
    }

    pub async fn embedding_status(&self) -> crate::embedding::EmbeddingState {
        self.embeddings.status().await
    }
}

fn normalize(raw: &str) -> PathBuf {
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use npc_memory_config::MemoryServiceConfig;
    use serde_json::Map;

    fn test_config(dir: &std::path::Path) -> MemoryServiceConfig {
        let mut config = MemoryServiceConfig::default();
        config.tiers.recent_capacity = 2;
        config.tiers.buffer_threshold = 2;
        config.storage.recent_snapshot_path = dir.join("recent.json").to_string_lossy().to_string();
        config.storage.buffer_dir = dir.join("buffer").to_string_lossy().to_string();
        config.storage.vector_store_dir = dir.join("vectors").to_string_lossy().to_string();
        config
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("npc-memory-coordinator-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn fifo_eviction_feeds_buffer_and_autoembeds() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let char_id = "aria".to_string();

        let r1 = coordinator.add(&char_id, "one", Map::new()).await?;
        assert!(!r1.evicted_to_buffer && !r1.buffer_auto_embedded);
        coordinator.add(&char_id, "two", Map::new()).await?;
        // Third add evicts "one" into the buffer (capacity 2).
        let r3 = coordinator.add(&char_id, "three", Map::new()).await?;
        assert!(r3.evicted_to_buffer && !r3.buffer_auto_embedded);
        assert_eq!(coordinator.buffer.len(&char_id).await?, 1);

        // Fourth add evicts "two", reaching the buffer threshold of 2 and
        // triggering an auto-embed, which empties the buffer again.
        let r4 = coordinator.add(&char_id, "four", Map::new()).await?;
        assert!(r4.evicted_to_buffer && r4.buffer_auto_embedded);
        assert_eq!(coordinator.buffer.len(&char_id).await?, 0);

        let recent: Vec<String> = coordinator.get_recent(&char_id).await.into_iter().map(|e| e.content).collect();
        assert_eq!(recent, vec!["three", "four"]);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_fifo_eviction_r5_b10() -> Result<()> {
        // Literal R=5, B=10: add e1..e6, expect get_recent == [e2..e6],
        // buffer == [e1], and the 6th add's result has
        // evicted_to_buffer=true, buffer_auto_embedded=false.
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();

        let mut last = None;
        for i in 1..=6 {
            last = Some(coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?);
        }
        let last = last.unwrap();
        assert!(last.evicted_to_buffer);
        assert!(!last.buffer_auto_embedded);

        let recent: Vec<String> = coordinator.get_recent(&char_id).await.into_iter().map(|e| e.content).collect();
        assert_eq!(recent, vec!["e2", "e3", "e4", "e5", "e6"]);
        let buffered: Vec<String> = coordinator.export(&char_id).await?.buffered.into_iter().map(|e| e.content).collect();
        assert_eq!(buffered, vec!["e1"]);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_auto_embed_r5_b10() -> Result<()> {
        // Literal R=5, B=10: add e1..e15, expect get_recent == [e11..e15],
        // buffer empty, vector collection holds exactly {e1..e10}, and the
        // 15th add's result has buffer_auto_embedded=true.
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();

        let mut last = None;
        for i in 1..=15 {
            last = Some(coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?);
        }
        let last = last.unwrap();
        assert!(last.buffer_auto_embedded);

        let recent: Vec<String> = coordinator.get_recent(&char_id).await.into_iter().map(|e| e.content).collect();
        assert_eq!(recent, vec!["e11", "e12", "e13", "e14", "e15"]);

        let export = coordinator.export(&char_id).await?;
        assert!(export.buffered.is_empty());
        let mut indexed: Vec<String> = export.indexed.into_iter().map(|e| e.content).collect();
        indexed.sort();
        let mut expected: Vec<String> = (1..=10).map(|i| format!("e{i}")).collect();
        expected.sort();
        assert_eq!(indexed, expected);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn search_finds_embedded_entry() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let char_id = "bram".to_string();

        coordinator.add(&char_id, "likes tea", Map::new()).await?;
        coordinator.add(&char_id, "likes coffee", Map::new()).await?;
        coordinator.add(&char_id, "fought a dragon", Map::new()).await?;
        coordinator.force_embed(&char_id).await?;

        let hits = coordinator.search(&char_id, "likes tea", Some(3)).await?;
        assert!(!hits.is_empty());
        assert!(hits.iter().any(|h| h.entry.content == "likes tea"));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn export_import_round_trips() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let char_id = "nyx".to_string();
        coordinator.add(&char_id, "one", Map::new()).await?;
        coordinator.add(&char_id, "two", Map::new()).await?;
        coordinator.add(&char_id, "three", Map::new()).await?;

        let export = coordinator.export(&char_id).await?;
        coordinator.clear(&char_id).await?;
        assert!(coordinator.export(&char_id).await?.recent.is_empty());

        coordinator.import(export.clone()).await?;
        let reimported = coordinator.export(&char_id).await?;
        assert_eq!(reimported.recent.len(), export.recent.len());
        let original_contents: Vec<&str> = export.recent.iter().map(|e| e.content.as_str()).collect();
        let reimported_contents: Vec<&str> = reimported.recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(original_contents, reimported_contents);

        // Ids are regenerated on import, never reused from the exported bundle.
        let original_ids: std::collections::HashSet<_> = export.recent.iter().map(|e| e.id).collect();
        let reimported_ids: std::collections::HashSet<_> = reimported.recent.iter().map(|e| e.id).collect();
        assert!(original_ids.is_disjoint(&reimported_ids));

        // Timestamps are preserved from the exported bundle.
        let original_timestamps: Vec<_> = export.recent.iter().map(|e| e.timestamp).collect();
        let reimported_timestamps: Vec<_> = reimported.recent.iter().map(|e| e.timestamp).collect();
        assert_eq!(original_timestamps, reimported_timestamps);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn clear_isolates_other_characters() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        coordinator.add(&"a".to_string(), "alpha", Map::new()).await?;
        coordinator.add(&"b".to_string(), "beta", Map::new()).await?;

        coordinator.clear(&"a".to_string()).await?;
        assert!(coordinator.get_recent(&"a".to_string()).await.is_empty());
        assert_eq!(coordinator.get_recent(&"b".to_string()).await.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn clear_leaves_no_orphan_files_and_character_vanishes_from_listing() -> Result<()> {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();
        for i in 1..=15 {
            coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?;
        }

        coordinator.clear(&char_id).await?;

        assert!(coordinator.get_recent(&char_id).await.is_empty());
        assert!(coordinator.search(&char_id, "e1", None).await?.is_empty());
        assert!(!coordinator.list_characters().await?.iter().any(|s| s.character == char_id));

        let buffer_path = std::path::Path::new(&config.storage.buffer_dir).join(format!("{char_id}.json"));
        assert!(!buffer_path.exists());
        let vector_path = std::path::Path::new(&config.storage.vector_store_dir).join(format!("{char_id}.redb"));
        assert!(!vector_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn clear_reports_per_tier_counts() -> Result<()> {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();
        for i in 1..=15 {
            coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?;
        }

        let counts = coordinator.clear(&char_id).await?;
        assert_eq!(counts.recent_deleted, 5);
        assert_eq!(counts.buffer_deleted, 0);
        assert_eq!(counts.longterm_deleted, 10);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn update_and_delete_report_location() -> Result<()> {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();
        for i in 1..=15 {
            coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?;
        }
        // e1..e10 are now in the vector index, e11..e15 in recent.
        let longterm = coordinator.export(&char_id).await?.indexed;
        let e1_id = longterm.iter().find(|e| e.content == "e1").unwrap().id;

        let location = coordinator.update(&char_id, e1_id, "rewritten", Map::new()).await?;
        assert_eq!(location, MemoryLocation::LongTerm);

        let recent_id = coordinator.get_recent(&char_id).await[0].id;
        let location = coordinator.delete(&char_id, recent_id).await?;
        assert_eq!(location, MemoryLocation::Recent);

        let err = coordinator.update(&char_id, Uuid::new_v4(), "nope", Map::new()).await.unwrap_err();
        assert!(matches!(err, MemoryError::NotFound { .. }));

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn update_in_longterm_is_searchable_by_new_content() -> Result<()> {
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();
        for i in 1..=15 {
            coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?;
        }
        let longterm = coordinator.export(&char_id).await?.indexed;
        let e1_id = longterm.iter().find(|e| e.content == "e1").unwrap().id;

        coordinator.update(&char_id, e1_id, "rewritten", Map::new()).await?;
        let hits = coordinator.search(&char_id, "rewritten", Some(1)).await?;
        assert_eq!(hits[0].entry.id, e1_id);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn get_context_skips_relevant_without_a_query() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let char_id = "c".to_string();
        coordinator.add(&char_id, "likes tea", Map::new()).await?;

        let bundle = coordinator.get_context(&char_id, None, None).await?;
        assert_eq!(bundle.recent.len(), 1);
        assert!(bundle.relevant.is_empty());

        let bundle = coordinator.get_context(&char_id, Some("tea"), None).await?;
        assert_eq!(bundle.recent.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn list_characters_reports_summaries() -> Result<()> {
        let dir = temp_dir();
        let config = test_config(&dir);
        let coordinator = MemoryCoordinator::new(&config);
        coordinator.add(&"a".to_string(), "alpha", Map::new()).await?;
        coordinator.add(&"b".to_string(), "beta", Map::new()).await?;

        let summaries = coordinator.list_characters().await?;
        assert_eq!(summaries.len(), 2);
        let a = summaries.iter().find(|s| s.character == "a").unwrap();
        assert_eq!(a.recent_count, 1);
        assert_eq!(a.longterm_count, 0);
        assert!(a.last_insert.is_some());

        // Neither character has ever been embedded, so listing them must not
        // have materialized a vector-store file for either one.
        assert!(!std::path::Path::new(&config.storage.vector_store_dir).join("a.redb").exists());
        assert!(!std::path::Path::new(&config.storage.vector_store_dir).join("b.redb").exists());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn reads_and_probes_never_create_a_vector_store_file() -> Result<()> {
        let dir = temp_dir();
        let config = test_config(&dir);
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "never-embedded".to_string();
        coordinator.add(&char_id, "still in recent", Map::new()).await?;

        // A search, a probing update/delete of a nonexistent id, an export,
        // and list_characters are all reads — none of them touch long-term
        // storage for a character that has never been embedded, so none of
        // them should bring a `.redb` file into existence.
        let _ = coordinator.search(&char_id, "anything", None).await?;
        let _ = coordinator.update(&char_id, Uuid::new_v4(), "x", Map::new()).await;
        let _ = coordinator.delete(&char_id, Uuid::new_v4()).await;
        let _ = coordinator.export(&char_id).await?;
        let _ = coordinator.list_characters().await?;

        let vector_path = std::path::Path::new(&config.storage.vector_store_dir).join(format!("{char_id}.redb"));
        assert!(!vector_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn force_embed_chunks_an_oversized_buffer_by_max_embed_batch() -> Result<()> {
        // A buffer larger than max_embed_batch (here: larger than the
        // buffer_threshold too, simulating a backlog that built up while
        // embeddings were unavailable) must still be embedded completely in
        // one force_embed call, in batches no larger than max_embed_batch.
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 2;
        config.tiers.buffer_threshold = 100;
        config.embedding.max_embed_batch = 3;
        let coordinator = MemoryCoordinator::new(&config);
        let char_id = "c".to_string();

        for i in 1..=10 {
            coordinator.add(&char_id, &format!("e{i}"), Map::new()).await?;
        }
        assert_eq!(coordinator.buffer.len(&char_id).await?, 8);

        let embedded = coordinator.force_embed(&char_id).await?;
        assert_eq!(embedded, 8);
        assert_eq!(coordinator.buffer.len(&char_id).await?, 0);

        let indexed = coordinator.export(&char_id).await?.indexed;
        assert_eq!(indexed.len(), 8);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn force_embed_on_empty_buffer_is_a_noop() -> Result<()> {
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let embedded = coordinator.force_embed(&"fresh".to_string()).await?;
        assert_eq!(embedded, 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn second_force_embed_after_a_real_embed_is_a_noop() -> Result<()> {
        // Two consecutive force_embed(c) calls with no intervening adds —
        // the second must report count=0, even right after the first one
        // actually embedded something.
        let dir = temp_dir();
        let coordinator = MemoryCoordinator::new(&test_config(&dir));
        let char_id = "c".to_string();
        coordinator.add(&char_id, "one", Map::new()).await?;
        coordinator.add(&char_id, "two", Map::new()).await?;

        let first = coordinator.force_embed(&char_id).await?;
        assert!(first > 0);
        let second = coordinator.force_embed(&char_id).await?;
        assert_eq!(second, 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn startup_restores_recent_snapshot() -> Result<()> {
        let dir = temp_dir();
        let config = test_config(&dir);
        let char_id = "restart".to_string();
        {
            let coordinator = MemoryCoordinator::new(&config);
            coordinator.startup().await?;
            coordinator.add(&char_id, "before restart", Map::new()).await?;
            coordinator.shutdown().await?;
        }
        let coordinator = MemoryCoordinator::new(&config);
        coordinator.startup().await?;
        let recent = coordinator.get_recent(&char_id).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "before restart");

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn scenario_restart_persistence_two_characters() -> Result<()> {
        // 3 entries to c1, 12 to c2; restart; c1's recent is its original 3
        // entries in order, c2's recent is the last 5, and a search on c2
        // against one of the first 10 contents (now in the vector index)
        // finds it.
        let dir = temp_dir();
        let mut config = test_config(&dir);
        config.tiers.recent_capacity = 5;
        config.tiers.buffer_threshold = 10;
        let c1 = "c1".to_string();
        let c2 = "c2".to_string();
        {
            let coordinator = MemoryCoordinator::new(&config);
            coordinator.startup().await?;
            for i in 1..=3 {
                coordinator.add(&c1, &format!("c1-e{i}"), Map::new()).await?;
            }
            for i in 1..=12 {
                coordinator.add(&c2, &format!("c2-e{i}"), Map::new()).await?;
            }
            coordinator.shutdown().await?;
        }

        let coordinator = MemoryCoordinator::new(&config);
        coordinator.startup().await?;

        let c1_recent: Vec<String> = coordinator.get_recent(&c1).await.into_iter().map(|e| e.content).collect();
        assert_eq!(c1_recent, vec!["c1-e1", "c1-e2", "c1-e3"]);

        let c2_recent: Vec<String> = coordinator.get_recent(&c2).await.into_iter().map(|e| e.content).collect();
        assert_eq!(c2_recent, vec!["c2-e8", "c2-e9", "c2-e10", "c2-e11", "c2-e12"]);

        // 12 adds against R=5/B=10 evict only 7 entries into the buffer
        // (c2-e1..c2-e7), short of the auto-embed threshold, so a content
        // from that range is findable only once force_embed pushes the
        // buffer into the vector index — the deferred-embed behavior for a
        // buffer that hasn't yet crossed B.
        coordinator.force_embed(&c2).await?;
        let hits = coordinator.search(&c2, "c2-e3", Some(1)).await?;
        assert!(!hits.is_empty());
        assert_eq!(hits[0].entry.content, "c2-e3");

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
