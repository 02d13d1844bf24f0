//! Profile research pipeline.
//!
//! Given a title: resolve it on AniList (merging sequential seasons),
//! harvest the series' Fandom wiki, run four structured interpretation
//! calls, and persist the resulting narrative profile plus its lore index.

pub mod interpret;
pub mod merge;
pub mod pipeline;
pub mod validate;

pub use merge::{MergedSeries, disambiguation_candidates, merge_sequential};
pub use pipeline::{ResearchPhase, ResearchPipeline, chunk_raw_content};
pub use validate::{ContentValidation, validate_scraped};

pub type Result<T> = std::result::Result<T, ResearchError>;

#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    #[error(transparent)]
    Scrape(#[from] aidm_scrape::ScrapeError),

    #[error(transparent)]
    Llm(#[from] aidm_llm::LlmError),

    #[error(transparent)]
    Profile(#[from] aidm_profile::ProfileError),

    #[error(transparent)]
    Memory(#[from] aidm_memory::MemoryError),

    /// Structural dials (Call 1) failed; nothing was persisted.
    #[error("research failed: {0}")]
    Failed(String),
}
