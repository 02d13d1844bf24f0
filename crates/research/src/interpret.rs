//! The four structured interpretation calls and their fallbacks.
//!
//! Each call has a schemars-typed output so the schema sent to the model
//! and the deserialization target cannot drift. Call 4 is deliberately
//! narrow — interrelated narrative-voice fields only; it does not also
//! produce voice cards, power distribution, or trope corrections.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::Deserialize;

use aidm_profile::{
    AuthorVoice, CombatStyle, DnaScales, PacingStyle, PowerDistribution, PowerSystem, SceneLength,
    Tone, Trope, VoiceCard,
};

use crate::merge::MergedSeries;

/// Canonical agent name for every research-pipeline model call.
pub const RESEARCH_AGENT: &str = "anime_research";

// ── Call 1: structural dials ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct StructuralDials {
    pub dna_scales: DnaScales,
    pub tone: Tone,
    pub combat_style: CombatStyle,
    pub power_distribution: PowerDistribution,
    pub storytelling_tropes: Vec<Trope>,
}

pub fn structural_prompt(series: &MergedSeries, lore_summary: &str) -> String {
    let trope_glossary = Trope::ALL
        .iter()
        .map(|t| format!("- {}", t.definition()))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "Analyze this series' storytelling structure.\n\n\
         TITLE: {name}\nGENRES: {genres}\nTAGS: {tags}\n\nSYNOPSIS:\n{synopsis}\n\n\
         WIKI LORE (excerpt):\n{lore}\n\n\
         Rate each DNA scale 0-10 where 0 means the FIRST word of the scale name \
         dominates (introspection_vs_action = 2 means introspective). Power tiers \
         run T1 (strongest) to T11 (weakest).\n\n\
         Apply tropes only when their canonical definition fits:\n{trope_glossary}",
        name = series.name,
        genres = series.genres.join(", "),
        tags = series.tags.join(", "),
        synopsis = truncate(&series.synopsis, 2000),
        lore = truncate(lore_summary, 3000),
    )
}

// ── Call 2: power system ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PowerSystemExtraction {
    pub power_system: PowerSystem,
}

pub fn power_system_prompt(series: &MergedSeries, technique_lore: &str) -> String {
    format!(
        "Extract this series' power system as canon constraints a game master \
         must respect.\n\nTITLE: {name}\n\nTECHNIQUE / ABILITY PAGES:\n{lore}\n\n\
         Name the system, describe its mechanics and acquisition path, list hard \
         limitations one per entry, and describe what peak practitioners can do.",
        name = series.name,
        lore = truncate(technique_lore, 6000),
    )
}

/// Degraded output when Call 2 fails: a usable shell derived from metadata.
pub fn fallback_power_system(series: &MergedSeries) -> PowerSystem {
    PowerSystem {
        name: format!("{} power system", series.name),
        mechanics: truncate(&series.synopsis, 400),
        limitations: vec!["Abilities stay within what the source material shows".to_string()],
        acquisition: "As depicted in the source material".to_string(),
        peak: "Top-tier characters from the source material".to_string(),
    }
}

// ── Call 3: voice cards ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct VoiceCardExtraction {
    /// Normalized character key → voice card.
    pub voice_cards: BTreeMap<String, VoiceCard>,
}

pub fn voice_cards_prompt(series: &MergedSeries, character_lore: &str, main_cast: &[String]) -> String {
    format!(
        "Build dialogue voice cards for this series' cast.\n\nTITLE: {name}\n\n\
         CHARACTER PAGES (with any quoted dialogue):\n{lore}\n\n\
         Mine quotable dialogue from the pages where present. ALSO synthesize \
         cards from your own knowledge of the series for the main cast even when \
         their pages carry no quotes: {main_cast}.\n\
         Key every card by lowercase_underscore character name.",
        name = series.name,
        lore = truncate(character_lore, 6000),
        main_cast = main_cast.join(", "),
    )
}

/// Main cast = top N characters by wiki page length, falling back to the
/// AniList cast order when no pages exist.
pub fn main_cast_by_page_length(
    character_sections: &[(String, String)],
    anilist_cast: &[String],
    top_n: usize,
) -> Vec<String> {
    if character_sections.is_empty() {
        return anilist_cast.iter().take(top_n).cloned().collect();
    }
    let mut ranked: Vec<&(String, String)> = character_sections.iter().collect();
    ranked.sort_by_key(|(_, text)| std::cmp::Reverse(text.len()));
    ranked.into_iter().take(top_n).map(|(title, _)| title.clone()).collect()
}

// ── Call 4: narrative synthesis ──────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct NarrativeSynthesis {
    /// IP-authentic directing voice, written as prose.
    pub director_personality: String,
    pub author_voice: AuthorVoice,
    pub pacing_style: PacingStyle,
}

pub fn synthesis_prompt(
    series: &MergedSeries,
    dials: &StructuralDials,
    power_system: &PowerSystem,
) -> String {
    format!(
        "Synthesize this series' narrative voice from the structural analysis \
         below. Write the director personality as prose in the IP's own \
         creative register, not a restatement of the dials.\n\n\
         TITLE: {name}\nGENRES: {genres}\n\nSYNOPSIS:\n{synopsis}\n\n\
         DNA DIALS (0 = first word dominates): {dials:?}\n\
         TONE: {tone:?}\nTROPES: {tropes:?}\nPOWER SYSTEM: {power}\n\n\
         Produce director_personality, author_voice (sentence patterns, \
         structural motifs, dialogue quirks, emotional rhythm, and a short \
         example_voice passage), and pacing_style.",
        name = series.name,
        genres = series.genres.join(", "),
        synopsis = truncate(&series.synopsis, 1500),
        dials = dials.dna_scales,
        tone = dials.tone,
        tropes = dials.storytelling_tropes,
        power = power_system.name,
    )
}

/// Deterministic template when Call 4 fails. Polarity matters: a LOW dial
/// value means the first-named pole dominates.
pub fn fallback_synthesis(series: &MergedSeries, dials: &StructuralDials) -> NarrativeSynthesis {
    let dna = &dials.dna_scales;
    let interiority = if dna.introspection_vs_action < 4 {
        "lingers in quiet interiority"
    } else if dna.introspection_vs_action > 6 {
        "keeps scenes in motion"
    } else {
        "balances reflection and motion"
    };
    let register = if dna.comedy_vs_drama < 4 {
        "reaches for humor readily"
    } else if dna.comedy_vs_drama > 6 {
        "holds a dramatic register"
    } else {
        "moves between levity and weight"
    };
    let outlook = if dna.hopeful_vs_cynical < 4 {
        "warm"
    } else if dna.hopeful_vs_cynical > 6 {
        "unsentimental"
    } else {
        "measured"
    };

    NarrativeSynthesis {
        director_personality: format!(
            "A director who {interiority}, {register}, and frames the world with a {outlook} eye, \
             in the manner of {}.",
            series.name
        ),
        author_voice: AuthorVoice {
            sentence_patterns: format!("Sentence rhythm follows the pacing of {}.", series.name),
            structural_motifs: "Scene structure mirrors the source's arc shapes.".to_string(),
            dialogue_quirks: "Dialogue keeps the cast's canonical registers.".to_string(),
            emotional_rhythm: format!("Emotional beats land with a {outlook} cadence."),
            example_voice: String::new(),
        },
        pacing_style: PacingStyle {
            scene_length: SceneLength::from_pacing_dial(dna.fast_paced_vs_slow_burn),
            arc_length_sessions: if dna.episodic_vs_serialized < 4 { 2 } else { 4 },
        },
    }
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}…")
}
