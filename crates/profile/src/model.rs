use std::collections::{BTreeMap, BTreeSet};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{ProfileError, Result};

// ── DNA scales ───────────────────────────────────────────────────────────────

/// Eleven 0–10 dials capturing the IP's storytelling character. Each dial
/// maps to concrete narration behavior; `narration_guide` renders the
/// mapping for the key animator's stable prompt block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DnaScales {
    pub introspection_vs_action: u8,
    pub comedy_vs_drama: u8,
    pub simple_vs_complex: u8,
    pub power_fantasy_vs_struggle: u8,
    pub explained_vs_mysterious: u8,
    pub fast_paced_vs_slow_burn: u8,
    pub episodic_vs_serialized: u8,
    pub grounded_vs_absurd: u8,
    pub tactical_vs_instinctive: u8,
    pub hopeful_vs_cynical: u8,
    pub ensemble_vs_solo: u8,
}

impl DnaScales {
    pub fn validate(&self) -> Result<()> {
        for (name, value) in self.dials() {
            if value > 10 {
                return Err(ProfileError::Incomplete(format!(
                    "dna scale {name} out of range: {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn dials(&self) -> [(&'static str, u8); 11] {
        [
            ("introspection_vs_action", self.introspection_vs_action),
            ("comedy_vs_drama", self.comedy_vs_drama),
            ("simple_vs_complex", self.simple_vs_complex),
            ("power_fantasy_vs_struggle", self.power_fantasy_vs_struggle),
            ("explained_vs_mysterious", self.explained_vs_mysterious),
            ("fast_paced_vs_slow_burn", self.fast_paced_vs_slow_burn),
            ("episodic_vs_serialized", self.episodic_vs_serialized),
            ("grounded_vs_absurd", self.grounded_vs_absurd),
            ("tactical_vs_instinctive", self.tactical_vs_instinctive),
            ("hopeful_vs_cynical", self.hopeful_vs_cynical),
            ("ensemble_vs_solo", self.ensemble_vs_solo),
        ]
    }

    /// Render the narration-behavior mapping for prompt injection. Low ends
    /// of each dial name the LEFT pole: a 2 on `introspection_vs_action`
    /// means introspective, not action-heavy.
    pub fn narration_guide(&self) -> String {
        let mut lines = Vec::with_capacity(11);
        lines.push(format!(
            "- Interiority: {}",
            if self.introspection_vs_action <= 3 {
                "linger inside the viewpoint character's head; action serves reflection"
            } else if self.introspection_vs_action >= 7 {
                "keep thoughts brief; momentum and physical detail carry scenes"
            } else {
                "balance inner monologue against outward motion"
            }
        ));
        lines.push(format!(
            "- Register: {}",
            if self.comedy_vs_drama <= 3 {
                "comedic beats are welcome even mid-tension"
            } else if self.comedy_vs_drama >= 7 {
                "dramatic weight first; humor only as rare relief"
            } else {
                "alternate levity and gravity scene to scene"
            }
        ));
        lines.push(format!(
            "- Pacing: {}",
            if self.fast_paced_vs_slow_burn <= 3 {
                "2-3 short paragraphs, punchy sentences per beat"
            } else if self.fast_paced_vs_slow_burn >= 7 {
                "let scenes breathe; atmosphere and silence are content"
            } else {
                "moderate scene length with selective lingering"
            }
        ));
        lines.push(format!(
            "- Mystery: {}",
            if self.explained_vs_mysterious <= 3 {
                "explain mechanics onscreen when they matter"
            } else if self.explained_vs_mysterious >= 7 {
                "leave the machinery of the world half-glimpsed"
            } else {
                "explain what the protagonist would know, no more"
            }
        ));
        lines.push(format!(
            "- Outlook: {}",
            if self.hopeful_vs_cynical <= 3 {
                "earned warmth; kindness is rewarded eventually"
            } else if self.hopeful_vs_cynical >= 7 {
                "victories cost; trust is a risk"
            } else {
                "mixed outcomes; hope and loss share scenes"
            }
        ));
        lines.push(format!(
            "- Cast focus: {}",
            if self.ensemble_vs_solo <= 3 {
                "rotate spotlight across the ensemble"
            } else if self.ensemble_vs_solo >= 7 {
                "stay tight on the protagonist's experience"
            } else {
                "protagonist-led with recurring ensemble beats"
            }
        ));
        lines.join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Tone {
    pub darkness: u8,
    pub comedy: u8,
    pub optimism: u8,
}

// ── Tropes ───────────────────────────────────────────────────────────────────

/// Bounded trope vocabulary. Definitions double as the research prompt's
/// canonical glossary, correcting common misclassifications.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Trope {
    SlowBurnRomance,
    FoundFamily,
    TournamentArc,
    PowerOfBonds,
    TragicBackstory,
    HiddenPower,
    MentorSacrifice,
    RedemptionArc,
    ChosenOne,
    MonsterOfTheWeek,
    TimeSkip,
    UnderdogRise,
}

impl Trope {
    pub const ALL: [Trope; 12] = [
        Trope::SlowBurnRomance,
        Trope::FoundFamily,
        Trope::TournamentArc,
        Trope::PowerOfBonds,
        Trope::TragicBackstory,
        Trope::HiddenPower,
        Trope::MentorSacrifice,
        Trope::RedemptionArc,
        Trope::ChosenOne,
        Trope::MonsterOfTheWeek,
        Trope::TimeSkip,
        Trope::UnderdogRise,
    ];

    pub fn definition(self) -> &'static str {
        match self {
            Trope::SlowBurnRomance => {
                "slow_burn_romance: romantic arc spanning a majority of the runtime, not necessarily explicit"
            }
            Trope::FoundFamily => {
                "found_family: unrelated characters come to function as each other's family unit"
            }
            Trope::TournamentArc => {
                "tournament_arc: a formal bracketed competition structures a major arc"
            }
            Trope::PowerOfBonds => {
                "power_of_bonds: relationships concretely increase characters' effective strength"
            }
            Trope::TragicBackstory => {
                "tragic_backstory: past loss or trauma is load-bearing for a main character's motivation"
            }
            Trope::HiddenPower => {
                "hidden_power: a protagonist conceals or is unaware of significant ability"
            }
            Trope::MentorSacrifice => {
                "mentor_sacrifice: a mentor figure dies or is lost to advance the protagonist's arc"
            }
            Trope::RedemptionArc => {
                "redemption_arc: an antagonist or rival is deliberately turned over multiple arcs"
            }
            Trope::ChosenOne => {
                "chosen_one: the protagonist is singled out by prophecy, birthright, or unique gift"
            }
            Trope::MonsterOfTheWeek => {
                "monster_of_the_week: self-contained episodic threats dominate the structure"
            }
            Trope::TimeSkip => "time_skip: the narrative jumps years forward at least once",
            Trope::UnderdogRise => {
                "underdog_rise: the protagonist starts demonstrably weaker than the setting's baseline"
            }
        }
    }
}

// ── Combat & power ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CombatStyle {
    Tactical,
    Spectacle,
    Martial,
    Magical,
    Absent,
}

/// Canon constraints the key animator must respect. Limitations are injected
/// verbatim as "you MUST respect" text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PowerSystem {
    pub name: String,
    pub mechanics: String,
    pub limitations: Vec<String>,
    pub acquisition: String,
    pub peak: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerGradient {
    Spike,
    TopHeavy,
    Flat,
    Compressed,
}

/// Stratified world-power descriptor replacing the legacy single
/// `world_tier` value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PowerDistribution {
    pub peak_tier: String,
    pub typical_tier: String,
    pub floor_tier: String,
    pub gradient: PowerGradient,
}

/// Parse a power tier in either accepted form (`T3` or `tier_3`). Lower
/// numbers are stronger; valid tiers are 1..=11.
pub fn parse_tier(tier: &str) -> Option<u8> {
    let trimmed = tier.trim();
    let digits = trimmed
        .strip_prefix("tier_")
        .or_else(|| trimmed.strip_prefix("Tier_"))
        .or_else(|| trimmed.strip_prefix('T'))
        .or_else(|| trimmed.strip_prefix('t'))?;
    let number: u8 = digits.parse().ok()?;
    (1..=11).contains(&number).then_some(number)
}

pub fn format_tier(number: u8) -> String {
    format!("T{}", number.clamp(1, 11))
}

// ── Status ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Finished,
    Releasing,
    Hiatus,
}

impl ReleaseStatus {
    /// Merge priority across seasons: an ongoing season makes the merged
    /// profile ongoing.
    pub fn priority(self) -> u8 {
        match self {
            ReleaseStatus::Releasing => 2,
            ReleaseStatus::Hiatus => 1,
            ReleaseStatus::Finished => 0,
        }
    }

    pub fn from_anilist(status: &str) -> Self {
        match status {
            "RELEASING" => ReleaseStatus::Releasing,
            "HIATUS" => ReleaseStatus::Hiatus,
            _ => ReleaseStatus::Finished,
        }
    }
}

// ── Voices ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct VoiceCard {
    pub speech_patterns: String,
    pub humor_type: String,
    pub signature_phrases: Vec<String>,
    pub dialogue_rhythm: String,
    pub emotional_expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AuthorVoice {
    pub sentence_patterns: String,
    pub structural_motifs: String,
    pub dialogue_quirks: String,
    pub emotional_rhythm: String,
    pub example_voice: String,
}

/// Voice-card keys are normalized: lowercase, underscores.
pub fn normalize_voice_key(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

// ── Pacing ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SceneLength {
    Rapid,
    Brisk,
    Moderate,
    Deliberate,
    Languid,
}

impl SceneLength {
    /// The scene-length contract handed to the key animator.
    pub fn contract(self) -> &'static str {
        match self {
            SceneLength::Rapid => {
                "2-3 short paragraphs, punchy sentences, minimal internal monologue"
            }
            SceneLength::Brisk => "3-4 paragraphs",
            SceneLength::Moderate => "4 paragraphs with selective introspection",
            SceneLength::Deliberate => "4-5 paragraphs with internal monologue beats",
            SceneLength::Languid => {
                "5-7 paragraphs, literary prose, significant atmosphere"
            }
        }
    }

    /// Deterministic derivation from the pacing dial, used when the
    /// synthesis call degrades.
    pub fn from_pacing_dial(fast_paced_vs_slow_burn: u8) -> Self {
        match fast_paced_vs_slow_burn {
            0..=1 => SceneLength::Rapid,
            2..=3 => SceneLength::Brisk,
            4..=6 => SceneLength::Moderate,
            7..=8 => SceneLength::Deliberate,
            _ => SceneLength::Languid,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PacingStyle {
    pub scene_length: SceneLength,
    pub arc_length_sessions: u32,
}

// ── Composition axes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TensionSource {
    Existential,
    Relational,
    Moral,
    Burden,
    Information,
    Consequence,
    Control,
    Emotional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PowerExpression {
    Instantaneous,
    Overwhelming,
    Sealed,
    Hidden,
    Conditional,
    Derivative,
    Passive,
    Subtle,
    Spectacle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NarrativeFocus {
    Internal,
    Ensemble,
    ReverseEnsemble,
    Episodic,
    Faction,
    Mundane,
    Competition,
    Legacy,
    Solo,
}

/// IP-level default narrative framing. Per-scene effective composition is
/// recomputed by the engine from this plus the character's OP settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Composition {
    pub tension_source: TensionSource,
    pub power_expression: PowerExpression,
    pub narrative_focus: NarrativeFocus,
}

impl Composition {
    /// Derive default axes from DNA when research produced no explicit
    /// composition.
    pub fn derive_from_dna(dna: &DnaScales, tropes: &BTreeSet<Trope>) -> Self {
        let tension_source = if tropes.contains(&Trope::TragicBackstory) {
            TensionSource::Burden
        } else if dna.hopeful_vs_cynical >= 7 {
            TensionSource::Consequence
        } else if dna.comedy_vs_drama >= 7 {
            TensionSource::Emotional
        } else {
            TensionSource::Relational
        };

        let power_expression = if dna.grounded_vs_absurd >= 7 {
            PowerExpression::Spectacle
        } else if dna.tactical_vs_instinctive <= 3 {
            PowerExpression::Conditional
        } else {
            PowerExpression::Overwhelming
        };

        let narrative_focus = if dna.ensemble_vs_solo <= 3 {
            NarrativeFocus::Ensemble
        } else if dna.episodic_vs_serialized <= 3 {
            NarrativeFocus::Episodic
        } else {
            NarrativeFocus::Solo
        };

        Self {
            tension_source,
            power_expression,
            narrative_focus,
        }
    }
}

// ── The profile ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NarrativeProfile {
    /// Slug; primary identifier for all lore and memory references.
    /// Immutable after creation.
    pub id: String,
    pub name: String,
    pub aliases: Vec<String>,
    pub romanized_title: Option<String>,
    pub native_title: Option<String>,
    pub status: ReleaseStatus,
    pub series_group: String,
    pub series_position: u32,
    pub dna_scales: DnaScales,
    pub tone: Tone,
    pub storytelling_tropes: BTreeSet<Trope>,
    pub combat_style: CombatStyle,
    pub power_system: PowerSystem,
    pub power_distribution: PowerDistribution,
    pub detected_genres: Vec<String>,
    pub voice_cards: BTreeMap<String, VoiceCard>,
    pub author_voice: AuthorVoice,
    pub director_personality: String,
    pub pacing_style: PacingStyle,
    pub composition: Composition,
    #[serde(default)]
    pub needs_review: bool,
}

impl NarrativeProfile {
    /// Core-field completeness gate applied at persistence time.
    pub fn validate_complete(&self) -> Result<()> {
        if self.id.is_empty() || !self.id.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
            return Err(ProfileError::Incomplete(format!(
                "id must be a snake_case slug, got '{}'",
                self.id
            )));
        }
        self.dna_scales.validate()?;
        if self.power_system.name.is_empty() {
            return Err(ProfileError::Incomplete("power_system.name empty".to_string()));
        }
        for tier in [
            &self.power_distribution.peak_tier,
            &self.power_distribution.typical_tier,
            &self.power_distribution.floor_tier,
        ] {
            if parse_tier(tier).is_none() {
                return Err(ProfileError::Incomplete(format!(
                    "unparseable power tier '{tier}'"
                )));
            }
        }
        Ok(())
    }

    /// All names this profile answers to, for the alias index.
    pub fn all_names(&self) -> Vec<String> {
        let mut names = vec![self.name.clone()];
        names.extend(self.aliases.iter().cloned());
        if let Some(romanized) = &self.romanized_title {
            names.push(romanized.clone());
        }
        if let Some(native) = &self.native_title {
            names.push(native.clone());
        }
        names
    }
}

/// Build a profile slug from a display name.
pub fn slugify(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
pub(crate) fn sample_profile(id: &str) -> NarrativeProfile {
    NarrativeProfile {
        id: id.to_string(),
        name: "Frieren: Beyond Journey's End".to_string(),
        aliases: vec!["Frieren".to_string()],
        romanized_title: Some("Sousou no Frieren".to_string()),
        native_title: Some("葬送のフリーレン".to_string()),
        status: ReleaseStatus::Releasing,
        series_group: "sousou_no_frieren".to_string(),
        series_position: 1,
        dna_scales: DnaScales {
            introspection_vs_action: 2,
            comedy_vs_drama: 4,
            simple_vs_complex: 4,
            power_fantasy_vs_struggle: 3,
            explained_vs_mysterious: 6,
            fast_paced_vs_slow_burn: 8,
            episodic_vs_serialized: 4,
            grounded_vs_absurd: 3,
            tactical_vs_instinctive: 3,
            hopeful_vs_cynical: 3,
            ensemble_vs_solo: 4,
        },
        tone: Tone {
            darkness: 3,
            comedy: 4,
            optimism: 7,
        },
        storytelling_tropes: BTreeSet::from([Trope::FoundFamily, Trope::TimeSkip]),
        combat_style: CombatStyle::Magical,
        power_system: PowerSystem {
            name: "Mana and spellcraft".to_string(),
            mechanics: "Spells are learned techniques; mana reserves grow over decades.".to_string(),
            limitations: vec!["Mana suppression hides strength but caps output".to_string()],
            acquisition: "Study and long practice".to_string(),
            peak: "Great mages can level battlefields".to_string(),
        },
        power_distribution: PowerDistribution {
            peak_tier: "T2".to_string(),
            typical_tier: "T7".to_string(),
            floor_tier: "T9".to_string(),
            gradient: PowerGradient::TopHeavy,
        },
        detected_genres: vec!["Fantasy".to_string(), "Adventure".to_string()],
        voice_cards: BTreeMap::new(),
        author_voice: AuthorVoice::default(),
        director_personality: "Patient, elegiac, finds weight in small gestures.".to_string(),
        pacing_style: PacingStyle {
            scene_length: SceneLength::Deliberate,
            arc_length_sessions: 4,
        },
        composition: Composition {
            tension_source: TensionSource::Emotional,
            power_expression: PowerExpression::Passive,
            narrative_focus: NarrativeFocus::Ensemble,
        },
        needs_review: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_parsing_accepts_both_forms() {
        assert_eq!(parse_tier("T3"), Some(3));
        assert_eq!(parse_tier("tier_3"), Some(3));
        assert_eq!(parse_tier("t11"), Some(11));
        assert_eq!(parse_tier("T0"), None);
        assert_eq!(parse_tier("T12"), None);
        assert_eq!(parse_tier("strong"), None);
    }

    #[test]
    fn voice_keys_normalize_to_snake_case() {
        assert_eq!(normalize_voice_key("Frieren"), "frieren");
        assert_eq!(normalize_voice_key("Himmel the Hero"), "himmel_the_hero");
        assert_eq!(normalize_voice_key("  Stark!  "), "stark");
    }

    #[test]
    fn low_introspection_dial_means_introspective() {
        let mut dna = sample_profile("x").dna_scales;
        dna.introspection_vs_action = 2;
        let guide = dna.narration_guide();
        assert!(guide.contains("linger inside"), "guide was: {guide}");

        dna.introspection_vs_action = 9;
        let guide = dna.narration_guide();
        assert!(guide.contains("momentum"), "guide was: {guide}");
    }

    #[test]
    fn scale_out_of_range_fails_validation() {
        let mut profile = sample_profile("frieren_beyond_journeys_end");
        profile.dna_scales.comedy_vs_drama = 11;
        assert!(matches!(
            profile.validate_complete(),
            Err(ProfileError::Incomplete(_))
        ));
    }

    #[test]
    fn empty_power_system_is_incomplete() {
        let mut profile = sample_profile("frieren_beyond_journeys_end");
        profile.power_system.name.clear();
        assert!(profile.validate_complete().is_err());
    }

    #[test]
    fn status_priority_prefers_releasing() {
        let mut statuses = [
            ReleaseStatus::Finished,
            ReleaseStatus::Releasing,
            ReleaseStatus::Hiatus,
        ];
        statuses.sort_by_key(|s| std::cmp::Reverse(s.priority()));
        assert_eq!(statuses[0], ReleaseStatus::Releasing);
    }

    #[test]
    fn composition_derivation_honors_dna_poles() {
        let profile = sample_profile("x");
        let mut dna = profile.dna_scales;
        dna.ensemble_vs_solo = 2;
        dna.hopeful_vs_cynical = 8;
        let composition = Composition::derive_from_dna(&dna, &BTreeSet::new());
        assert_eq!(composition.narrative_focus, NarrativeFocus::Ensemble);
        assert_eq!(composition.tension_source, TensionSource::Consequence);
    }

    #[test]
    fn tragic_backstory_dominates_tension_derivation() {
        let profile = sample_profile("x");
        let tropes = BTreeSet::from([Trope::TragicBackstory]);
        let composition = Composition::derive_from_dna(&profile.dna_scales, &tropes);
        assert_eq!(composition.tension_source, TensionSource::Burden);
    }

    #[test]
    fn scene_length_bands_cover_dial_range() {
        assert_eq!(SceneLength::from_pacing_dial(0), SceneLength::Rapid);
        assert_eq!(SceneLength::from_pacing_dial(5), SceneLength::Moderate);
        assert_eq!(SceneLength::from_pacing_dial(10), SceneLength::Languid);
    }

    #[test]
    fn slugify_builds_snake_case_ids() {
        assert_eq!(
            slugify("Frieren: Beyond Journey's End"),
            "frieren_beyond_journey_s_end"
        );
    }

    #[test]
    fn all_names_include_romanized_and_native() {
        let profile = sample_profile("frieren_beyond_journeys_end");
        let names = profile.all_names();
        assert!(names.iter().any(|n| n == "Sousou no Frieren"));
        assert!(names.iter().any(|n| n == "葬送のフリーレン"));
    }
}
