//! The narrative engine: agent roster, composition, foreshadowing, and the
//! per-turn orchestration pipeline.
//!
//! Everything above the stores lives here. One [`orchestrator::Engine`] per
//! process runs one campaign at a time; within a turn, Stage-A agents run
//! concurrently, the key animator writes the scene, a single deferred
//! transaction commits primary state, and background tasks fan out after
//! the reply is returned.

pub mod agents;
pub mod composition;
#[cfg(test)]
pub(crate) mod test_fixtures;
pub mod foreshadow;
pub mod guard;
pub mod orchestrator;
pub mod rules;
pub mod session_zero;

pub use aidm_profile::NarrativeProfile;
pub use composition::{EffectiveComposition, NarrativeMode, power_differential};
pub use foreshadow::{ArcGateInputs, SeedLedger, evaluate_arc_gate};
pub use guard::{ResourceGuard, ResourceCost};
pub use orchestrator::{Engine, EnginePaths, TurnOutput};
pub use session_zero::{CharacterDraft, SessionZeroPhase, derive_power_tier};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Action exceeds the character's HP/MP/SP budget and
    /// `narrative_override_resources` is off.
    #[error("insufficient resources: {0}")]
    ResourceInsufficient(String),

    #[error("no active campaign")]
    NoActiveCampaign,

    /// The key animator failed twice; the turn was not committed. The
    /// message is already narrator-voiced.
    #[error("{0}")]
    AnimatorSilent(String),

    #[error("illegal seed transition: {0}")]
    IllegalSeedTransition(String),

    #[error(transparent)]
    Llm(#[from] aidm_llm::LlmError),

    #[error(transparent)]
    Store(#[from] aidm_store::StoreError),

    #[error(transparent)]
    Profile(#[from] aidm_profile::ProfileError),

    #[error(transparent)]
    Memory(#[from] aidm_memory::MemoryError),

    #[error(transparent)]
    Research(#[from] aidm_research::ResearchError),

    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}
