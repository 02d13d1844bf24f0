//! Shared test fixtures.

use std::collections::{BTreeMap, BTreeSet};

use aidm_profile::{
    AuthorVoice, CombatStyle, Composition, DnaScales, NarrativeFocus, NarrativeProfile,
    PacingStyle, PowerDistribution, PowerExpression, PowerGradient, PowerSystem, ReleaseStatus,
    SceneLength, TensionSource, Tone, Trope,
};

pub(crate) fn sample_profile(id: &str) -> NarrativeProfile {
    NarrativeProfile {
        id: id.to_string(),
        name: "Frieren: Beyond Journey's End".to_string(),
        aliases: vec!["Frieren".to_string()],
        romanized_title: Some("Sousou no Frieren".to_string()),
        native_title: None,
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
