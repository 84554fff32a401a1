use thiserror::Error;

/// Error taxonomy for the memory engine.
///
/// Component-local errors (`redb`, file I/O) are wrapped into
/// [`MemoryError::StorageFailure`] at the tier boundary rather than leaked
/// to callers as raw library error types, so a transport layer can map each
/// variant onto an HTTP status code 1:1.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Content missing or whitespace-only on `add`/`update`. Maps to 400.
    #[error("memory content must not be empty")]
    EmptyContent,

    /// Character or memory id not found. Maps to 404.
    #[error("memory {id} not found for character {character}")]
    NotFound { character: String, id: String },

    /// Embedding engine not ready or failed. Maps to 503. Non-embedding
    /// reads and `add` into the recent tier still succeed; auto-embed of a
    /// full buffer is deferred until the next successful `add` or
    /// `force_embed`.
    #[error("embedding engine unavailable: {reason}")]
    EmbeddingUnavailable { reason: String },

    /// Disk or vector-store I/O error. Maps to 500. State is left intact:
    /// the buffer→index embed procedure only commits a step once the
    /// previous one succeeded, so a failure here never leaves a half-moved
    /// entry.
    #[error("storage failure: {0}")]
    StorageFailure(#[from] anyhow::Error),

    /// Schema/type mismatch. Maps to 422.
    #[error("validation failure: {0}")]
    ValidationFailure(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
