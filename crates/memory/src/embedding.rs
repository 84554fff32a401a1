//! Embedding engine: lifecycle state machine plus pluggable backend
//! selection.
//!
//! The default build carries only [`HashingEmbeddingModel`], a deterministic
//! feature-hashing backend that never touches the network, so the crate's
//! test suite is reproducible offline. Enabling the `candle-embeddings`
//! feature additionally compiles [`candle_backend::CandleEmbeddingModel`],
//! which downloads and runs a real sentence-transformer.
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{info, warn};

use npc_memory_config::EmbeddingBackend as BackendSelector;

use crate::error::{MemoryError, Result};

/// Output dimensionality of every backend in this crate. Fixed rather than
/// backend-reported so callers can size vector buffers ahead of a cold
/// engine ("dimension is stable for the process lifetime").
pub const EMBEDDING_DIM: usize = 384;

/// A text-to-vector backend. Implementors run on a blocking thread pool via
/// `spawn_blocking` — nothing here is async internally.
pub trait EmbeddingModel: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Deterministic feature-hashing backend (default, always compiled).
///
/// Tokens are lower-cased and split on non-alphanumeric boundaries; each
/// token hashes via SHA-256 into a dimension index and a sign, accumulated
/// and then L2-normalized. Same input always yields the same vector, and no
/// model weights or network access are required.
pub struct HashingEmbeddingModel {
    dim: usize,
}

impl HashingEmbeddingModel {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for HashingEmbeddingModel {
    fn default() -> Self {
        Self::new(EMBEDDING_DIM)
    }
}

impl EmbeddingModel for HashingEmbeddingModel {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| hash_embed(t, self.dim)).collect())
    }
}

fn hash_embed(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dim];
    for token in text.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
        let lower = token.to_lowercase();
        let mut hasher = Sha256::new();
        hasher.update(lower.as_bytes());
        let digest = hasher.finalize();
        let idx_bytes: [u8; 8] = digest[0..8].try_into().expect("sha256 digest is 32 bytes");
        let idx = (u64::from_le_bytes(idx_bytes) as usize) % dim;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[idx] += sign;
    }
    l2_normalize(&mut vector);
    vector
}

pub fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(feature = "candle-embeddings")]
mod candle_backend {
    use super::{l2_normalize, EmbeddingModel};
    use anyhow::{Context, Result};
    use candle_core::{DType, Device, Tensor};
    use candle_transformers::models::bert::{BertModel, Config as BertConfig};
    use hf_hub::api::sync::Api;
    use npc_memory_config::EmbeddingBackend as BackendSelector;
    use tokenizers::{PaddingParams, Tokenizer};

    const MODEL_ID: &str = "sentence-transformers/all-MiniLM-L6-v2";

    /// Real sentence-transformer backend, grounded in the mean-pooling +
    /// L2-normalize inference pipeline used across the corpus's retrieval
    /// crates. Device selection maps the backend selector directly onto
    /// candle's `Device` constructors.
    pub struct CandleEmbeddingModel {
        model: BertModel,
        tokenizer: Tokenizer,
        device: Device,
        dim: usize,
    }

    impl CandleEmbeddingModel {
        pub fn load(selector: BackendSelector) -> Result<Self> {
            let device = select_device(selector)?;
            let api = Api::new()?;
            let repo = api.model(MODEL_ID.to_string());

            let config_path = repo.get("config.json").context("downloading model config")?;
            let tokenizer_path = repo.get("tokenizer.json").context("downloading tokenizer")?;
            let weights_path = repo.get("pytorch_model.bin").context("downloading model weights")?;

            let config: BertConfig = serde_json::from_str(&std::fs::read_to_string(config_path)?)?;
            let mut tokenizer = Tokenizer::from_file(tokenizer_path).map_err(anyhow::Error::msg)?;
            tokenizer.with_padding(Some(PaddingParams::default()));

            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                    .or_else(|_| -> Result<_> {
                        candle_nn::VarBuilder::from_pth(&weights_path, DType::F32, &device)
                            .context("loading model weights")
                    })?
            };
            let model = BertModel::load(vb, &config)?;
            let dim = config.hidden_size;

            Ok(Self { model, tokenizer, device, dim })
        }
    }

    impl EmbeddingModel for CandleEmbeddingModel {
        fn dimension(&self) -> usize {
            self.dim
        }

        fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let encodings = self.tokenizer.encode_batch(texts.to_vec(), true).map_err(anyhow::Error::msg)?;
            let mut out = Vec::with_capacity(texts.len());
            for encoding in encodings {
                let ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
                let mask = Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;
                let token_type_ids = ids.zeros_like()?;
                let hidden = self.model.forward(&ids, &token_type_ids, Some(&mask))?;
                let pooled = mean_pooling(&hidden, &mask)?;
                let mut vector: Vec<f32> = pooled.squeeze(0)?.to_vec1()?;
                l2_normalize(&mut vector);
                out.push(vector);
            }
            Ok(out)
        }
    }

    fn mean_pooling(hidden: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(hidden.dtype())?.unsqueeze(2)?.broadcast_as(hidden.shape())?;
        let summed = (hidden * &mask)?.sum(1)?;
        let counts = mask.sum(1)?.clamp(1e-9, f64::MAX)?;
        Ok((summed / counts)?)
    }

    fn select_device(selector: BackendSelector) -> Result<Device> {
        match selector {
            BackendSelector::Cpu => Ok(Device::Cpu),
            BackendSelector::GpuCuda => Device::new_cuda(0).context("requested cuda device unavailable"),
            BackendSelector::GpuMetal => Device::new_metal(0).context("requested metal device unavailable"),
            BackendSelector::Auto => Device::new_cuda(0)
                .or_else(|_| Device::new_metal(0))
                .or_else(|_| Ok(Device::Cpu)),
        }
    }
}

/// Lifecycle state of the embedding engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingState {
    Uninitialized,
    Loading,
    Ready,
    Failed { reason: String },
}

/// Process-wide embedding handle. Held behind an `Arc` and shared by the
/// coordinator rather than stashed in a global static — a single shared
/// instance gives the "one engine per process" guarantee without the
/// double-checked-locking machinery a true global would need.
pub struct EmbeddingEngine {
    selector: BackendSelector,
    state: RwLock<EmbeddingState>,
    model: RwLock<Option<Arc<dyn EmbeddingModel>>>,
}

impl EmbeddingEngine {
    pub fn new(selector: BackendSelector) -> Self {
        Self {
            selector,
            state: RwLock::new(EmbeddingState::Uninitialized),
            model: RwLock::new(None),
        }
    }

    pub async fn status(&self) -> EmbeddingState {
        self.state.read().await.clone()
    }

    /// Construct the backend and transition state. Idempotent: calling this
    /// again while `Ready` is a no-op; calling it again after `Failed`
    /// retries construction.
    pub async fn warmup(&self) -> Result<()> {
        {
            let state = self.state.read().await;
            if matches!(*state, EmbeddingState::Ready) {
                return Ok(());
            }
        }
        *self.state.write().await = EmbeddingState::Loading;

        let selector = self.selector;
        let built = tokio::task::spawn_blocking(move || build_backend(selector))
            .await
            .map_err(|e| MemoryError::EmbeddingUnavailable { reason: format!("backend init task panicked: {e}") })?;

        match built {
            Ok(model) => {
                info!(backend = %selector, dim = model.dimension(), "embedding engine ready");
                *self.model.write().await = Some(model);
                *self.state.write().await = EmbeddingState::Ready;
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(backend = %selector, error = %reason, "embedding engine failed to initialize");
                *self.state.write().await = EmbeddingState::Failed { reason: reason.clone() };
                Err(MemoryError::EmbeddingUnavailable { reason })
            }
        }
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(std::slice::from_ref(&text.to_string())).await?;
        Ok(vectors.pop().expect("embed_many returns one vector per input"))
    }

    /// Embed a batch. Lazily warms the engine up on first use rather than
    /// requiring every caller to remember to call `warmup` ("a
    /// read that needs the engine before `preload` has finished blocks on
    /// initialization, it does not error").
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        {
            let model = self.model.read().await;
            if let Some(model) = model.as_ref() {
                let model = Arc::clone(model);
                let owned = texts.to_vec();
                return tokio::task::spawn_blocking(move || model.embed_batch(&owned))
                    .await
                    .map_err(|e| MemoryError::EmbeddingUnavailable { reason: format!("embed task panicked: {e}") })?
                    .map_err(|e| MemoryError::EmbeddingUnavailable { reason: e.to_string() });
            }
        }

        self.warmup().await?;

        let model = self.model.read().await;
        let model = model
            .as_ref()
            .ok_or_else(|| MemoryError::EmbeddingUnavailable { reason: "engine not ready after warmup".to_string() })?;
        let model = Arc::clone(model);
        let owned = texts.to_vec();
        tokio::task::spawn_blocking(move || model.embed_batch(&owned))
            .await
            .map_err(|e| MemoryError::EmbeddingUnavailable { reason: format!("embed task panicked: {e}") })?
            .map_err(|e| MemoryError::EmbeddingUnavailable { reason: e.to_string() })
    }

    pub fn dimension(&self) -> usize {
        EMBEDDING_DIM
    }
}

fn build_backend(selector: BackendSelector) -> anyhow::Result<Arc<dyn EmbeddingModel>> {
    #[cfg(feature = "candle-embeddings")]
    {
        return Ok(Arc::new(candle_backend::CandleEmbeddingModel::load(selector)?));
    }
    #[cfg(not(feature = "candle-embeddings"))]
    {
        let _ = selector;
        Ok(Arc::new(HashingEmbeddingModel::default()))
    }
}
