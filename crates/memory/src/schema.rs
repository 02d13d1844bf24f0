use serde::{Deserialize, Serialize};

pub const HEAT_MAX: f32 = 100.0;
pub const HEAT_INITIAL: f32 = 60.0;
pub const HEAT_INITIAL_PLOT_CRITICAL: f32 = 80.0;
pub const HEAT_INITIAL_SESSION_ZERO: f32 = 100.0;
/// Plot-critical memories never cool below this.
pub const HEAT_FLOOR_PLOT_CRITICAL: f32 = 80.0;
/// Memories tagged to an NPC with any `first_*` milestone keep at least this.
pub const HEAT_FLOOR_MILESTONE_NPC: f32 = 40.0;
pub const RETRIEVAL_BOOST: f32 = 20.0;
pub const NPC_SWEEP_BOOST: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryCategory {
    Event,
    Relationship,
    Lore,
    NarrativeBeat,
    CharacterMoment,
    Atmosphere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecayRate {
    Fast,
    Normal,
    Slow,
}

impl DecayRate {
    /// Per-turn heat multiplier. Relationship memories cool the slowest
    /// regardless of their nominal rate.
    pub fn multiplier(self, category: MemoryCategory) -> f32 {
        if category == MemoryCategory::Relationship {
            return 0.97;
        }
        match self {
            DecayRate::Fast => 0.90,
            DecayRate::Normal => 0.93,
            DecayRate::Slow => 0.95,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub campaign_id: i64,
    pub text: String,
    pub category: MemoryCategory,
    pub heat: f32,
    pub decay_rate: DecayRate,
    pub plot_critical: bool,
    pub tagged_npcs: Vec<String>,
    pub tagged_locations: Vec<String>,
    pub origin_turn: i64,
    pub last_accessed_turn: i64,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryRecord {
    pub fn new(
        campaign_id: i64,
        text: impl Into<String>,
        category: MemoryCategory,
        origin_turn: i64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id,
            text: text.into(),
            category,
            heat: HEAT_INITIAL,
            decay_rate: DecayRate::Normal,
            plot_critical: false,
            tagged_npcs: Vec::new(),
            tagged_locations: Vec::new(),
            origin_turn,
            last_accessed_turn: origin_turn,
            archived: false,
            embedding: None,
        }
    }

    pub fn plot_critical(mut self) -> Self {
        self.plot_critical = true;
        self.heat = self.heat.max(HEAT_INITIAL_PLOT_CRITICAL);
        self
    }

    pub fn from_session_zero(mut self) -> Self {
        self.heat = HEAT_INITIAL_SESSION_ZERO;
        self
    }

    pub fn with_decay(mut self, rate: DecayRate) -> Self {
        self.decay_rate = rate;
        self
    }

    pub fn tagged(mut self, npcs: Vec<String>, locations: Vec<String>) -> Self {
        self.tagged_npcs = npcs;
        self.tagged_locations = locations;
        self
    }

    /// Clamp heat into `[floor, 100]` where the floor depends on pinning and
    /// milestone tagging.
    pub fn clamp_heat(&mut self, milestone_floor_applies: bool) {
        let mut floor = 0.0;
        if self.plot_critical {
            floor = HEAT_FLOOR_PLOT_CRITICAL;
        } else if milestone_floor_applies {
            floor = HEAT_FLOOR_MILESTONE_NPC;
        }
        self.heat = self.heat.clamp(floor, HEAT_MAX);
    }
}

/// A page-type-tagged chunk of scraped lore, shared across campaigns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoreChunk {
    pub id: String,
    pub profile_id: String,
    pub page_type: String,
    pub page_title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl LoreChunk {
    /// Deterministic id so re-ingesting a profile upserts rather than
    /// duplicates.
    pub fn stable_id(profile_id: &str, page_type: &str, page_title: &str) -> String {
        format!(
            "{profile_id}:{}:{}",
            page_type.to_lowercase(),
            page_title.to_lowercase().replace(' ', "_")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decay_multipliers_match_documented_rates() {
        assert_eq!(DecayRate::Fast.multiplier(MemoryCategory::Event), 0.90);
        assert_eq!(DecayRate::Normal.multiplier(MemoryCategory::Event), 0.93);
        assert_eq!(DecayRate::Slow.multiplier(MemoryCategory::Event), 0.95);
        // Relationship memories always use the slowest rate.
        assert_eq!(DecayRate::Fast.multiplier(MemoryCategory::Relationship), 0.97);
    }

    #[test]
    fn plot_critical_heat_floors_at_eighty() {
        let mut record = MemoryRecord::new(1, "x", MemoryCategory::Event, 1).plot_critical();
        record.heat = 10.0;
        record.clamp_heat(false);
        assert_eq!(record.heat, HEAT_FLOOR_PLOT_CRITICAL);
    }

    #[test]
    fn milestone_floor_applies_only_when_flagged() {
        let mut record = MemoryRecord::new(1, "x", MemoryCategory::Event, 1);
        record.heat = 5.0;
        record.clamp_heat(true);
        assert_eq!(record.heat, HEAT_FLOOR_MILESTONE_NPC);

        record.heat = 5.0;
        record.clamp_heat(false);
        assert_eq!(record.heat, 5.0);
    }

    #[test]
    fn heat_never_exceeds_one_hundred() {
        let mut record = MemoryRecord::new(1, "x", MemoryCategory::Event, 1);
        record.heat = 140.0;
        record.clamp_heat(false);
        assert_eq!(record.heat, HEAT_MAX);
    }

    #[test]
    fn session_zero_memories_start_at_full_heat() {
        let record = MemoryRecord::new(1, "x", MemoryCategory::Lore, 0).from_session_zero();
        assert_eq!(record.heat, HEAT_INITIAL_SESSION_ZERO);
    }

    #[test]
    fn lore_ids_are_stable_across_reingestion() {
        let a = LoreChunk::stable_id("frieren", "CHARACTER", "Fern");
        let b = LoreChunk::stable_id("frieren", "CHARACTER", "Fern");
        assert_eq!(a, b);
        assert_eq!(a, "frieren:character:fern");
    }
}
