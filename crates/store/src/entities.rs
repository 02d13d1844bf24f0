use serde::{Deserialize, Serialize};

// ── Campaign ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub name: String,
    pub profile_id: String,
    pub created_at: String,
}

// ── Character ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    /// `T1..T11`; lower = stronger.
    pub power_tier: String,
    pub level: i64,
    pub hp: i64,
    pub mp: i64,
    pub sp: i64,
    pub op_enabled: bool,
    pub op_tension_source: Option<String>,
    pub op_power_expression: Option<String>,
    pub op_narrative_focus: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewCharacter {
    pub campaign_id: i64,
    pub name: String,
    pub power_tier: String,
    pub level: i64,
    pub hp: i64,
    pub mp: i64,
    pub sp: i64,
    pub op_enabled: bool,
    pub op_tension_source: Option<String>,
    pub op_power_expression: Option<String>,
    pub op_narrative_focus: Option<String>,
}

// ── World state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcPhase {
    Setup,
    RisingAction,
    Climax,
    Resolution,
    Epilogue,
}

impl ArcPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            ArcPhase::Setup => "setup",
            ArcPhase::RisingAction => "rising_action",
            ArcPhase::Climax => "climax",
            ArcPhase::Resolution => "resolution",
            ArcPhase::Epilogue => "epilogue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "setup" => Some(ArcPhase::Setup),
            "rising_action" => Some(ArcPhase::RisingAction),
            "climax" => Some(ArcPhase::Climax),
            "resolution" => Some(ArcPhase::Resolution),
            "epilogue" => Some(ArcPhase::Epilogue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldState {
    pub campaign_id: i64,
    /// Human-readable situation summary, regenerated by the director.
    pub situation: String,
    pub tension_level: f64,
    pub arc_phase: ArcPhase,
    pub turns_in_phase: i64,
    pub threat_tier: Option<String>,
    pub current_location_id: Option<i64>,
}

// ── NPCs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Hostile,
    Wary,
    Neutral,
    Friendly,
    Trusting,
    Devoted,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::Hostile => "hostile",
            Disposition::Wary => "wary",
            Disposition::Neutral => "neutral",
            Disposition::Friendly => "friendly",
            Disposition::Trusting => "trusting",
            Disposition::Devoted => "devoted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hostile" => Some(Disposition::Hostile),
            "wary" => Some(Disposition::Wary),
            "neutral" => Some(Disposition::Neutral),
            "friendly" => Some(Disposition::Friendly),
            "trusting" => Some(Disposition::Trusting),
            "devoted" => Some(Disposition::Devoted),
            _ => None,
        }
    }

    /// Steps between two dispositions on the hostility ladder.
    pub fn distance(self, other: Disposition) -> u8 {
        (self as i8 - other as i8).unsigned_abs()
    }
}

/// NPC behavioral sophistication; advances one stage at a time as the
/// relationship analyzer observes sustained interaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntelligenceStage {
    Reactive,
    Contextual,
    Anticipatory,
    Autonomous,
}

impl IntelligenceStage {
    pub fn as_str(self) -> &'static str {
        match self {
            IntelligenceStage::Reactive => "reactive",
            IntelligenceStage::Contextual => "contextual",
            IntelligenceStage::Anticipatory => "anticipatory",
            IntelligenceStage::Autonomous => "autonomous",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reactive" => Some(IntelligenceStage::Reactive),
            "contextual" => Some(IntelligenceStage::Contextual),
            "anticipatory" => Some(IntelligenceStage::Anticipatory),
            "autonomous" => Some(IntelligenceStage::Autonomous),
            _ => None,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            IntelligenceStage::Reactive => Some(IntelligenceStage::Contextual),
            IntelligenceStage::Contextual => Some(IntelligenceStage::Anticipatory),
            IntelligenceStage::Anticipatory => Some(IntelligenceStage::Autonomous),
            IntelligenceStage::Autonomous => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Npc {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub disposition: Disposition,
    pub intelligence_stage: IntelligenceStage,
    pub interaction_count: i64,
    pub last_appeared: i64,
    /// Emotional milestone flags (`first_trust`, `first_vulnerability`, …).
    pub milestones: Vec<String>,
    pub notes: String,
}

// ── Factions & locations ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Faction {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub description: String,
    pub discovered: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Location {
    pub id: i64,
    pub campaign_id: i64,
    pub name: String,
    pub description: String,
    pub discovered: bool,
}

// ── Turns ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: i64,
    pub campaign_id: i64,
    pub turn_number: i64,
    pub player_input: String,
    pub intent: String,
    /// Agent decisions (outcome, scales) as JSON.
    pub decisions: serde_json::Value,
    pub narrative: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_hit_ratio: f64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewTurn {
    pub campaign_id: i64,
    pub turn_number: i64,
    pub player_input: String,
    pub intent: String,
    pub decisions: serde_json::Value,
    pub narrative: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_hit_ratio: f64,
}

// ── Campaign bible ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArcEntry {
    pub turn_number: i64,
    pub summary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignBible {
    pub campaign_id: i64,
    pub bible_version: i64,
    /// Director outputs with turn numbers; only the last 5 are retained.
    pub arc_history: Vec<ArcEntry>,
    pub active_threads: Vec<String>,
    pub resolved_threads: Vec<String>,
    pub character_arcs: serde_json::Value,
    pub world_state_changelog: Vec<String>,
}

impl CampaignBible {
    pub fn empty(campaign_id: i64) -> Self {
        Self {
            campaign_id,
            bible_version: 0,
            arc_history: Vec::new(),
            active_threads: Vec::new(),
            resolved_threads: Vec::new(),
            character_arcs: serde_json::Value::Object(Default::default()),
            world_state_changelog: Vec::new(),
        }
    }

    /// Append an arc entry, keeping only the most recent five.
    pub fn push_arc_entry(&mut self, entry: ArcEntry) {
        self.arc_history.push(entry);
        let overflow = self.arc_history.len().saturating_sub(5);
        if overflow > 0 {
            self.arc_history.drain(..overflow);
        }
    }
}

// ── Foreshadowing seeds ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedStatus {
    Planted,
    Mentioned,
    ReadyToResolve,
    Resolved,
    Abandoned,
    Overdue,
}

impl SeedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SeedStatus::Planted => "planted",
            SeedStatus::Mentioned => "mentioned",
            SeedStatus::ReadyToResolve => "ready_to_resolve",
            SeedStatus::Resolved => "resolved",
            SeedStatus::Abandoned => "abandoned",
            SeedStatus::Overdue => "overdue",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planted" => Some(SeedStatus::Planted),
            "mentioned" => Some(SeedStatus::Mentioned),
            "ready_to_resolve" => Some(SeedStatus::ReadyToResolve),
            "resolved" => Some(SeedStatus::Resolved),
            "abandoned" => Some(SeedStatus::Abandoned),
            "overdue" => Some(SeedStatus::Overdue),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        !matches!(self, SeedStatus::Resolved | SeedStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeshadowSeed {
    pub id: i64,
    pub campaign_id: i64,
    pub description: String,
    pub planted_turn: i64,
    pub seed_type: String,
    pub urgency: String,
    pub related_npcs: Vec<String>,
    pub expected_payoff: String,
    pub status: SeedStatus,
    pub max_turns_to_payoff: i64,
    pub resolution_narrative: Option<String>,
    /// Seed ids that must be resolved before this one can resolve.
    pub depends_on: Vec<i64>,
    /// Seed ids re-planted when this one resolves.
    pub triggers: Vec<i64>,
    /// Seed ids that cannot be active at the same time as this one.
    pub conflicts_with: Vec<i64>,
}

// ── Sessions, media, pending memories ────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub campaign_id: Option<i64>,
    /// Session-zero phase, or `play` once gameplay has begun.
    pub phase: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: i64,
    pub campaign_id: i64,
    pub kind: String,
    pub prompt: String,
    pub cost_usd: f64,
    pub origin_turn: i64,
}

/// Queued vector-store write. The relational store is authoritative; a
/// background worker drains this queue into the vector index with
/// idempotent upserts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMemory {
    pub id: i64,
    pub campaign_id: i64,
    pub origin_turn: i64,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arc_phase_round_trips() {
        for phase in [
            ArcPhase::Setup,
            ArcPhase::RisingAction,
            ArcPhase::Climax,
            ArcPhase::Resolution,
            ArcPhase::Epilogue,
        ] {
            assert_eq!(ArcPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(ArcPhase::parse("intermission"), None);
    }

    #[test]
    fn disposition_distance_counts_ladder_steps() {
        assert_eq!(Disposition::Hostile.distance(Disposition::Devoted), 5);
        assert_eq!(Disposition::Neutral.distance(Disposition::Friendly), 1);
        assert_eq!(Disposition::Wary.distance(Disposition::Wary), 0);
    }

    #[test]
    fn intelligence_stages_advance_in_order() {
        let mut stage = IntelligenceStage::Reactive;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(
            seen,
            vec![
                IntelligenceStage::Reactive,
                IntelligenceStage::Contextual,
                IntelligenceStage::Anticipatory,
                IntelligenceStage::Autonomous,
            ]
        );
    }

    #[test]
    fn seed_status_activity() {
        assert!(SeedStatus::Planted.is_active());
        assert!(SeedStatus::Overdue.is_active());
        assert!(!SeedStatus::Resolved.is_active());
        assert!(!SeedStatus::Abandoned.is_active());
    }

    #[test]
    fn bible_retains_last_five_arc_entries() {
        let mut bible = CampaignBible::empty(1);
        for n in 1..=7 {
            bible.push_arc_entry(ArcEntry {
                turn_number: n,
                summary: format!("arc {n}"),
            });
        }
        assert_eq!(bible.arc_history.len(), 5);
        assert_eq!(bible.arc_history[0].turn_number, 3);
        assert_eq!(bible.arc_history[4].turn_number, 7);
    }
}
