use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Compute backend the embedding engine selects at initialization.
///
/// `Auto` probes in order cuda → metal → cpu and picks the first available
/// device (see `npc_memory_core::embedding`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingBackend {
    Auto,
    Cpu,
    GpuCuda,
    GpuMetal,
}

impl Default for EmbeddingBackend {
    fn default() -> Self {
        Self::Auto
    }
}

impl fmt::Display for EmbeddingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Auto => "auto",
            Self::Cpu => "cpu",
            Self::GpuCuda => "gpu-cuda",
            Self::GpuMetal => "gpu-metal",
        };
        f.write_str(s)
    }
}

impl FromStr for EmbeddingBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "gpu-cuda" | "cuda" => Ok(Self::GpuCuda),
            "gpu-metal" | "metal" => Ok(Self::GpuMetal),
            other => bail!("unrecognized embedding backend: {other}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// `R` — max entries per character held in the recent tier.
    pub recent_capacity: usize,
    /// `B` — buffer size at which auto-embed fires.
    pub buffer_threshold: usize,
    /// Default `k` for `search` / `get_context` when the caller omits one.
    pub default_search_k: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self {
            recent_capacity: 5,
            buffer_threshold: 10,
            default_search_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub backend: EmbeddingBackend,
    /// Whether to warm up the embedding engine at startup rather than lazily
    /// on the first call.
    pub preload: bool,
    /// Upper bound passed to `embed_many`; larger than `buffer_threshold` so
    /// an oversized `force_embed` is never truncated mid-batch.
    pub max_embed_batch: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Auto,
            preload: false,
            max_embed_batch: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// File path for the consolidated recent-tier snapshot.
    pub recent_snapshot_path: String,
    /// Directory containing one buffer file per character.
    pub buffer_dir: String,
    /// Directory containing one redb vector collection per character.
    pub vector_store_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            recent_snapshot_path: ".npc_memory/recent_snapshot.json".to_string(),
            buffer_dir: ".npc_memory/buffer".to_string(),
            vector_store_dir: ".npc_memory/vector_store".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MemoryServiceConfig {
    pub tiers: TierConfig,
    pub embedding: EmbeddingConfig,
    pub storage: StorageConfig,
    pub telemetry: TelemetryConfig,
}

impl MemoryServiceConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    /// Apply `NPC_MEMORY_*` environment variable overrides on top of whatever
    /// TOML (or defaults) were loaded, one variable per config field.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("NPC_MEMORY_RECENT_CAPACITY") {
            self.tiers.recent_capacity = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_BUFFER_THRESHOLD") {
            self.tiers.buffer_threshold = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_DEFAULT_SEARCH_K") {
            self.tiers.default_search_k = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_EMBEDDING_BACKEND") {
            self.embedding.backend = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_PRELOAD_EMBEDDINGS") {
            self.embedding.preload = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_MAX_EMBED_BATCH") {
            self.embedding.max_embed_batch = v.parse()?;
        }
        if let Some(v) = env_var("NPC_MEMORY_RECENT_SNAPSHOT_PATH") {
            self.storage.recent_snapshot_path = normalize_path(&v);
        }
        if let Some(v) = env_var("NPC_MEMORY_BUFFER_DIR") {
            self.storage.buffer_dir = normalize_path(&v);
        }
        if let Some(v) = env_var("NPC_MEMORY_VECTOR_STORE_DIR") {
            self.storage.vector_store_dir = normalize_path(&v);
        }
        if let Some(v) = env_var("NPC_MEMORY_LOG_LEVEL") {
            self.telemetry.log_level = v;
        }
        Ok(())
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// File paths in the config are platform-neutral: accept either separator
/// and store whatever the host platform expects.
fn normalize_path(raw: &str) -> String {
    raw.replace('\\', &std::path::MAIN_SEPARATOR.to_string())
        .replace('/', &std::path::MAIN_SEPARATOR.to_string())
}
