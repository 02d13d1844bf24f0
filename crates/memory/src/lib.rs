//! Campaign memory and lore retrieval.
//!
//! Two vector collections back the narrative engine: page-type-tagged lore
//! chunks (shared per profile) and per-campaign memories carrying the
//! heat/decay model. Both live as in-process indexes persisted through
//! JSONL document logs with idempotent, latest-wins replay. The relational
//! store remains the source of truth — writes arrive here via its
//! pending-memory queue.

pub mod log;
pub mod manager;
pub mod schema;
pub mod window;

pub use manager::{CompressionGroup, MemoryManager, MemoryStats, RankedHit, Retrieved, SearchFilter};
pub use schema::{DecayRate, LoreChunk, MemoryCategory, MemoryRecord};
pub use window::{PinSource, PinnedExchange, SlidingWindow, WindowTurn};

pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}
