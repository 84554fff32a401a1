//! Per-character dynamic memory engine for interactive narrative agents.
//!
//! Three tiers per character — a bounded recent FIFO, a durable staging
//! buffer, and a persistent vector index — feed into a single
//! [`coordinator::MemoryCoordinator`], the crate's only public entry point.
//! See `coordinator` for the write/read pipeline and `embedding` for the
//! pluggable text-to-vector backend.
pub mod buffer;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod recent;
pub mod schema;
pub mod vector_index;

pub use coordinator::{AddResult, CharacterExport, CharacterSummary, ClearCounts, ContextBundle, MemoryCoordinator, MemoryLocation, ScoredMemory};
pub use embedding::EmbeddingState;
pub use error::{MemoryError, Result};
pub use schema::{CharacterId, MemoryEntry};
