//! Narrative profiles: the studio bible for a media property.
//!
//! A profile captures an IP's creative vocabulary — DNA scales, tone,
//! tropes, power system, character voices, authorial voice — not its plot.
//! Profiles are created once by the research pipeline, stored as JSON
//! documents on disk, and shared read-only across campaigns.

pub mod alias;
pub mod model;
pub mod store;

pub use alias::{AliasIndex, MatchKind};
pub use model::{
    AuthorVoice, CombatStyle, Composition, DnaScales, NarrativeFocus, NarrativeProfile,
    PacingStyle, PowerDistribution, PowerExpression, PowerGradient, PowerSystem, ReleaseStatus,
    SceneLength, TensionSource, Tone, Trope, VoiceCard, format_tier, normalize_voice_key,
    parse_tier, slugify,
};
pub use store::ProfileStore;

pub type Result<T> = std::result::Result<T, ProfileError>;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("profile corrupt: {0}")]
    Corrupt(String),

    /// A profile either exists with its core fields complete or it does not
    /// exist; partial profiles are rejected at persistence time.
    #[error("profile incomplete: {0}")]
    Incomplete(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
