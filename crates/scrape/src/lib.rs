//! Source scrapers for the research pipeline.
//!
//! Two upstream services: the AniList GraphQL API (series metadata and the
//! franchise relations graph) and per-series Fandom wikis (MediaWiki API,
//! parsed HTML). Everything goes through a disk-backed TTL cache so repeat
//! research runs are free.

mod anilist;
mod cache;
mod fandom;

pub use anilist::{AniListClient, MediaEntry, MediaRelation, MediaTitle, pick_best_match};
pub use cache::TtlCache;
pub use fandom::{FandomClient, FandomWiki, HarvestedLore, PageType, slug_candidates};

pub type Result<T> = std::result::Result<T, ScrapeError>;

#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    /// Search or wiki discovery exhausted every candidate.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cache error: {0}")]
    Cache(String),
}

impl From<reqwest::Error> for ScrapeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}

impl From<serde_json::Error> for ScrapeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
