//! Long-term per-character vector index backed by one [`redb`] database per
//! character, using one `TableDefinition` per concern and bincode-on-redb
//! storage for both the entry metadata and its vector.
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};
use crate::schema::MemoryEntry;

/// `entry_id (str) -> bincode(StoredEntry)`, the entry plus its metadata.
const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
/// `entry_id (str) -> bincode(Vec<f32>)`, kept in a separate table so a
/// metadata-only read never deserializes the embedding.
const VECTORS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    entry: MemoryEntry,
}

fn bc_encode<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serde::encode_to_vec(value, bincode::config::standard())?)
}

fn bc_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    let (value, _len) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}

/// One similarity hit: the stored entry and its transformed score.
#[derive(Debug, Clone)]
pub struct ScoredEntry {
    pub entry: MemoryEntry,
    pub score: f32,
}

pub struct VectorIndex {
    db: Database,
    #[allow(dead_code)]
    path: PathBuf,
}

impl VectorIndex {
    /// Open (or create) the database file for one character.
    pub fn open(dir: impl AsRef<Path>, character: &str) -> anyhow::Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.redb", sanitize_filename(character)));
        let db = Database::create(&path)?;
        {
            let tx = db.begin_write()?;
            tx.open_table(ENTRIES_TABLE)?;
            tx.open_table(VECTORS_TABLE)?;
            tx.commit()?;
        }
        Ok(Self { db, path })
    }

    pub fn add(&self, entry: MemoryEntry, vector: Vec<f32>) -> anyhow::Result<()> {
        let id_str = entry.id.to_string();
        let stored = StoredEntry { entry };
        let entry_bytes = bc_encode(&stored)?;
        let vector_bytes = bc_encode(&vector)?;

        let tx = self.db.begin_write()?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            entries.insert(id_str.as_str(), entry_bytes.as_slice())?;
            let mut vectors = tx.open_table(VECTORS_TABLE)?;
            vectors.insert(id_str.as_str(), vector_bytes.as_slice())?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Brute-force nearest-neighbor scan: L2 distance transformed to a
    /// similarity score `1 / (1 + d)`, ties broken by the later timestamp
    ///. Fine at the scale this tier targets — one character's
    /// long-term store, not a cross-character index.
    pub fn query(&self, vector: &[f32], k: usize) -> anyhow::Result<Vec<ScoredEntry>> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let vectors = tx.open_table(VECTORS_TABLE)?;

        let mut scored = Vec::new();
        for item in entries.iter()? {
            let (key, value) = item?;
            let stored: StoredEntry = bc_decode(value.value())?;
            let Some(vector_bytes) = vectors.get(key.value())? else {
                continue;
            };
            let candidate: Vec<f32> = bc_decode(vector_bytes.value())?;
            let distance = l2_distance(vector, &candidate);
            let score = 1.0 / (1.0 + distance);
            scored.push(ScoredEntry { entry: stored.entry, score });
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entry.timestamp.cmp(&a.entry.timestamp))
        });
        scored.truncate(k);
        Ok(scored)
    }

    pub fn get_all(&self) -> anyhow::Result<Vec<MemoryEntry>> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        let mut out = Vec::new();
        for item in entries.iter()? {
            let (_, value) = item?;
            let stored: StoredEntry = bc_decode(value.value())?;
            out.push(stored.entry);
        }
        Ok(out)
    }

    pub fn contains(&self, id: Uuid) -> anyhow::Result<bool> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        Ok(entries.get(id.to_string().as_str())?.is_some())
    }

    pub fn update(
        &self,
        id: Uuid,
        content: &str,
        metadata: serde_json::Map<String, serde_json::Value>,
        new_vector: Option<Vec<f32>>,
    ) -> Result<()> {
        let id_str = id.to_string();
        let tx = self.db.begin_write().map_err(anyhow::Error::from)?;
        {
            let mut entries = tx.open_table(ENTRIES_TABLE).map_err(anyhow::Error::from)?;
            let mut stored: StoredEntry = match entries.get(id_str.as_str()).map_err(anyhow::Error::from)? {
                Some(v) => bc_decode(v.value())?,
                None => {
                    return Err(MemoryError::NotFound {
                        character: "<unspecified>".to_string(),
                        id: id_str,
                    });
                }
            };
            stored.entry.update_content(content, metadata)?;
            let bytes = bc_encode(&stored)?;
            entries.insert(id_str.as_str(), bytes.as_slice()).map_err(anyhow::Error::from)?;

            if let Some(vector) = new_vector {
                let mut vectors = tx.open_table(VECTORS_TABLE).map_err(anyhow::Error::from)?;
                let vector_bytes = bc_encode(&vector)?;
                vectors.insert(id_str.as_str(), vector_bytes.as_slice()).map_err(anyhow::Error::from)?;
            }
        }
        tx.commit().map_err(anyhow::Error::from)?;
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> anyhow::Result<bool> {
        let id_str = id.to_string();
        let tx = self.db.begin_write()?;
        let removed = {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            let mut vectors = tx.open_table(VECTORS_TABLE)?;
            let removed = entries.remove(id_str.as_str())?.is_some();
            vectors.remove(id_str.as_str())?;
            removed
        };
        tx.commit()?;
        Ok(removed)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let tx = self.db.begin_write()?;
        let removed = {
            let mut entries = tx.open_table(ENTRIES_TABLE)?;
            let mut vectors = tx.open_table(VECTORS_TABLE)?;
            let ids: Vec<String> = entries.iter()?.map(|r| r.map(|(k, _)| k.value().to_string())).collect::<std::result::Result<_, _>>()?;
            for id in &ids {
                entries.remove(id.as_str())?;
                vectors.remove(id.as_str())?;
            }
            ids.len()
        };
        tx.commit()?;
        Ok(removed)
    }

    pub fn len(&self) -> anyhow::Result<usize> {
        let tx = self.db.begin_read()?;
        let entries = tx.open_table(ENTRIES_TABLE)?;
        Ok(entries.iter()?.count())
    }
}

fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt()
}

fn sanitize_filename(character: &str) -> String {
    character
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Directory-scoped cache of per-character [`VectorIndex`] handles, avoiding
/// reopening the redb file on every call.
pub struct VectorIndexRegistry {
    dir: PathBuf,
    open: tokio::sync::Mutex<HashMap<String, std::sync::Arc<VectorIndex>>>,
}

impl VectorIndexRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            open: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Open-or-create the character's collection. Only writers (`add`,
    /// `embed_procedure`) should call this — it is the one path that may
    /// bring a `.redb` file into existence.
    pub async fn get(&self, character: &str) -> anyhow::Result<std::sync::Arc<VectorIndex>> {
        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(character) {
            return Ok(std::sync::Arc::clone(existing));
        }
        let index = std::sync::Arc::new(VectorIndex::open(&self.dir, character)?);
        open.insert(character.to_string(), std::sync::Arc::clone(&index));
        Ok(index)
    }

    /// Like [`Self::get`] but never creates a collection: returns `None`
    /// when the character has no cached handle and no `.redb` file on disk.
    /// Reads and probes (`search`, `update`/`delete` long-term probes,
    /// `export`, `list_characters`) must use this so a character that has
    /// never had long-term memory never gets an empty file materialized
    /// underneath it.
    pub async fn get_existing(&self, character: &str) -> anyhow::Result<Option<std::sync::Arc<VectorIndex>>> {
        let mut open = self.open.lock().await;
        if let Some(existing) = open.get(character) {
            return Ok(Some(std::sync::Arc::clone(existing)));
        }
        let path = self.dir.join(format!("{}.redb", sanitize_filename(character)));
        if !path.exists() {
            return Ok(None);
        }
        let index = std::sync::Arc::new(VectorIndex::open(&self.dir, character)?);
        open.insert(character.to_string(), std::sync::Arc::clone(&index));
        Ok(Some(index))
    }

    /// Empty and permanently remove one character's collection: clears its
    /// tables, drops the cached handle, and deletes the backing `.redb` file
    /// so no orphan survives on disk. A character with no collection yet is
    /// a no-op — this must never be the thing that brings a `.redb` file
    /// into existence.
    pub async fn clear_character(&self, character: &str) -> anyhow::Result<usize> {
        let Some(index) = self.get_existing(character).await? else {
            return Ok(0);
        };
        let removed = index.clear()?;
        let mut open = self.open.lock().await;
        open.remove(character);
        drop(index);
        let path = self.dir.join(format!("{}.redb", sanitize_filename(character)));
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(removed)
    }

    /// Every character with a collection, whether or not it has been opened
    /// yet this process — the cached (open) set plus whatever `.redb` files
    /// already exist on disk, so a fresh-restart process still reports
    /// characters nothing has touched since startup.
    pub async fn character_ids(&self) -> Vec<String> {
        let mut ids: std::collections::BTreeSet<String> = self.open.lock().await.keys().cloned().collect();
        if let Ok(read_dir) = std::fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().map(|e| e == "redb").unwrap_or(false) {
                    if let Some(stem) = path.file_stem() {
                        ids.insert(stem.to_string_lossy().to_string());
                    }
                }
            }
        }
        ids.into_iter().collect()
    }
}
