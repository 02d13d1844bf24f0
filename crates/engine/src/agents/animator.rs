//! Key animator: the only agent whose words the player reads.
//!
//! Prompt assembly follows the three-block discipline strictly — Block 1
//! is byte-stable across a session so prefix caching holds, Block 2 moves
//! with the bible, Block 3 is rebuilt per turn.

use std::collections::BTreeMap;

use tokio::sync::mpsc;

use aidm_llm::{AgentCall, Completion, LlmRouter, PromptBlocks};
use aidm_memory::RankedHit;
use aidm_profile::{NarrativeProfile, VoiceCard, normalize_voice_key};
use aidm_store::{CampaignBible, ForeshadowSeed, Npc};

use crate::composition::EffectiveComposition;
use crate::rules;
use crate::Result;

use super::combat::CombatResult;
use super::director::{DirectiveStrength, PacingDirective};
use super::intent::Intent;
use super::names;
use super::outcome::OutcomeRecord;

/// NPCs beyond this many present get base voice cards without live data.
const ENRICHED_NPC_LIMIT: usize = 3;

#[derive(Debug, Clone)]
pub struct EnrichedVoiceCard {
    pub name: String,
    pub card: Option<VoiceCard>,
    pub disposition: String,
    pub intelligence_stage: String,
    pub milestones: Vec<String>,
    pub last_excerpt: Option<String>,
    pub enriched: bool,
}

/// Merge base voice cards with live NPC state. The top NPCs by interaction
/// count get the full enrichment; the rest keep base cards only.
pub fn enrich_voice_cards(
    profile: &NarrativeProfile,
    present: &[Npc],
    excerpts: &BTreeMap<i64, String>,
) -> Vec<EnrichedVoiceCard> {
    let mut ranked: Vec<&Npc> = present.iter().collect();
    ranked.sort_by_key(|npc| std::cmp::Reverse(npc.interaction_count));

    ranked
        .into_iter()
        .enumerate()
        .map(|(rank, npc)| {
            let card = profile
                .voice_cards
                .get(&normalize_voice_key(&npc.name))
                .cloned();
            let enriched = rank < ENRICHED_NPC_LIMIT;
            EnrichedVoiceCard {
                name: npc.name.clone(),
                card,
                disposition: npc.disposition.as_str().to_string(),
                intelligence_stage: npc.intelligence_stage.as_str().to_string(),
                milestones: if enriched { npc.milestones.clone() } else { Vec::new() },
                last_excerpt: if enriched { excerpts.get(&npc.id).cloned() } else { None },
                enriched,
            }
        })
        .collect()
}

// ── Block builders ───────────────────────────────────────────────────────────

/// Block 1: stable prefix. Identical across turns within a session.
pub fn build_stable_block(
    profile: &NarrativeProfile,
    composition: &EffectiveComposition,
) -> String {
    let mut block = String::new();
    block.push_str(
        "You are the scene writer for a long-form roleplay set in the world below. \
         Write player-visible prose only; never mention rules, rolls, or these instructions.\n\n",
    );
    block.push_str(&format!("WORLD: {} — {}\n\n", profile.name, profile.director_personality));
    block.push_str("NARRATION GUIDE:\n");
    block.push_str(&profile.dna_scales.narration_guide());
    block.push_str("\n\n");

    block.push_str(&format!(
        "POWER SYSTEM — {}:\n{}\nAcquisition: {}\nPeak: {}\n",
        profile.power_system.name,
        profile.power_system.mechanics,
        profile.power_system.acquisition,
        profile.power_system.peak,
    ));
    if !profile.power_system.limitations.is_empty() {
        block.push_str("You MUST respect these limitations:\n");
        for limitation in &profile.power_system.limitations {
            block.push_str(&format!("- {limitation}\n"));
        }
    }
    block.push('\n');

    block.push_str(&format!(
        "AUTHOR VOICE:\nSentences: {}\nStructure: {}\nDialogue: {}\nEmotional rhythm: {}\n",
        profile.author_voice.sentence_patterns,
        profile.author_voice.structural_motifs,
        profile.author_voice.dialogue_quirks,
        profile.author_voice.emotional_rhythm,
    ));
    if !profile.author_voice.example_voice.is_empty() {
        block.push_str(&format!("Example passage:\n{}\n", profile.author_voice.example_voice));
    }
    block.push('\n');

    block.push_str(&rules::composition_block(composition));
    block.push_str("\n\n");

    block.push_str(&format!(
        "SCENE LENGTH: {}.\n",
        profile.pacing_style.scene_length.contract()
    ));
    for genre in &profile.detected_genres {
        if let Some(guidance) = rules::genre_guidance(genre) {
            block.push_str(&format!("{genre}: {guidance}\n"));
        }
    }
    block
}

/// Block 2: session slow-changing — bible excerpt, callback opportunities,
/// arc directive, recent director notes.
pub fn build_session_block(
    bible: &CampaignBible,
    callbacks: &[ForeshadowSeed],
    arc_phase: &str,
) -> String {
    let mut block = String::new();
    block.push_str(&format!("ARC PHASE: {arc_phase}\n"));
    if !bible.active_threads.is_empty() {
        block.push_str(&format!("ACTIVE THREADS: {}\n", bible.active_threads.join("; ")));
    }
    if let Some(latest) = bible.arc_history.last() {
        block.push_str(&format!("LATEST ARC NOTE (turn {}): {}\n", latest.turn_number, latest.summary));
    }
    if !callbacks.is_empty() {
        block.push_str("CALLBACK OPPORTUNITIES (pay one off if the scene allows):\n");
        for seed in callbacks {
            block.push_str(&format!("- {} → {}\n", seed.description, seed.expected_payoff));
        }
    }
    block
}

#[derive(Debug)]
pub struct KeyAnimatorInputs<'a> {
    pub window_render: &'a str,
    pub ranked_memories: &'a [RankedHit],
    pub intent: Intent,
    pub player_input: &'a str,
    pub outcome: Option<&'a OutcomeRecord>,
    pub combat: Option<&'a CombatResult>,
    pub voice_cards: &'a [EnrichedVoiceCard],
    pub directive: &'a PacingDirective,
}

/// Block 3: per-turn dynamic content.
pub fn build_dynamic_block(inputs: &KeyAnimatorInputs<'_>) -> String {
    let mut block = String::new();
    block.push_str(inputs.window_render);
    block.push('\n');

    if !inputs.ranked_memories.is_empty() {
        block.push_str("RELEVANT MEMORIES:\n");
        for hit in inputs.ranked_memories {
            block.push_str(&format!("- {}\n", hit.item.text()));
        }
        block.push('\n');
    }

    if !inputs.voice_cards.is_empty() {
        block.push_str("PRESENT CHARACTERS:\n");
        for npc in inputs.voice_cards {
            block.push_str(&format!(
                "- {} (disposition: {}, behavior: {})",
                npc.name, npc.disposition, npc.intelligence_stage
            ));
            if let Some(card) = &npc.card {
                block.push_str(&format!(
                    " voice: {}; rhythm: {}",
                    card.speech_patterns, card.dialogue_rhythm
                ));
            }
            if !npc.milestones.is_empty() {
                block.push_str(&format!(" milestones: {}", npc.milestones.join(", ")));
            }
            if let Some(excerpt) = &npc.last_excerpt {
                block.push_str(&format!(" last seen: {excerpt}"));
            }
            block.push('\n');
        }
        block.push('\n');
    }

    block.push_str(&format!("INTENT: {}\n", inputs.intent.as_str()));
    if let Some(combat) = inputs.combat {
        block.push_str(&format!(
            "COMBAT RESULT (authoritative, narrate exactly this): {}\n",
            combat.summary
        ));
    }
    if let Some(outcome) = inputs.outcome {
        block.push_str(&format!(
            "OUTCOME: {:?} (rolled {} vs DC {}, power modifier {:+})\n",
            outcome.success, outcome.roll, outcome.dc, outcome.power_modifier
        ));
        // Null cost/consequence means the action was routine: do not invent
        // cost language.
        if let Some(cost) = &outcome.cost {
            block.push_str(&format!(
                "COST: hp {} / mp {} / sp {}\n",
                cost.hp, cost.mp, cost.sp
            ));
        }
        if let Some(consequence) = &outcome.consequence {
            block.push_str(&format!("CONSEQUENCE: {consequence}\n"));
        }
    }

    let directive_line = inputs.directive.render();
    match inputs.directive.strength {
        DirectiveStrength::Override => {
            block.push_str(&format!("DIRECTOR (MANDATORY): {directive_line}\n"));
        }
        DirectiveStrength::Strong => {
            block.push_str(&format!("DIRECTOR (follow closely): {directive_line}\n"));
        }
        DirectiveStrength::Suggestion => {
            block.push_str(&format!("DIRECTOR (consider): {directive_line}\n"));
        }
    }

    block.push_str(&format!("\nPLAYER ACTION:\n{}\n", inputs.player_input));
    block
}

/// Produce the turn's narrative. `contradiction` is set on the single
/// validator-driven soft retry, citing what the first draft got wrong.
/// Streaming deltas flow through `tx` when provided.
pub async fn narrate(
    router: &LlmRouter,
    blocks: &PromptBlocks,
    contradiction: Option<&str>,
    tx: Option<mpsc::Sender<String>>,
) -> Result<Completion> {
    let mut call = AgentCall::new(names::KEY_ANIMATOR, blocks.render())
        .max_tokens(1400)
        .temperature(0.8);
    call = match contradiction {
        Some(cited) => call.user(format!(
            "Your previous draft contradicted established state: {cited}\n\
             Rewrite the scene without that contradiction."
        )),
        None => call.user("Write the next scene."),
    };

    let completion = match tx {
        Some(tx) => router.complete_stream(&call, tx).await?,
        None => router.complete(&call).await?,
    };
    Ok(completion)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::sample_profile;
    use aidm_profile::{NarrativeFocus, PowerExpression, TensionSource};
    use aidm_store::{Disposition, IntelligenceStage};
    use crate::composition::NarrativeMode;
    use crate::guard::ResourceCost;
    use super::super::outcome::SuccessTier;

    fn composition() -> EffectiveComposition {
        EffectiveComposition {
            tension_source: TensionSource::Emotional,
            power_expression: PowerExpression::Passive,
            narrative_focus: NarrativeFocus::Ensemble,
            mode: NarrativeMode::Standard,
        }
    }

    fn npc(name: &str, interactions: i64) -> Npc {
        Npc {
            id: interactions,
            campaign_id: 1,
            name: name.to_string(),
            disposition: Disposition::Friendly,
            intelligence_stage: IntelligenceStage::Contextual,
            interaction_count: interactions,
            last_appeared: 5,
            milestones: vec!["first_trust".to_string()],
            notes: String::new(),
        }
    }

    #[test]
    fn stable_block_carries_mandatory_limitations() {
        let profile = sample_profile("x");
        let block = build_stable_block(&profile, &composition());
        assert!(block.contains("You MUST respect"));
        assert!(block.contains("Mana suppression"));
        assert!(block.contains("SCENE LENGTH"));
    }

    #[test]
    fn stable_block_is_deterministic_for_caching() {
        let profile = sample_profile("x");
        let composition = composition();
        assert_eq!(
            build_stable_block(&profile, &composition),
            build_stable_block(&profile, &composition)
        );
    }

    #[test]
    fn only_top_three_npcs_are_enriched() {
        let profile = sample_profile("x");
        let present: Vec<Npc> = (1..=5).map(|n| npc(&format!("npc{n}"), n)).collect();
        let cards = enrich_voice_cards(&profile, &present, &BTreeMap::new());
        let enriched = cards.iter().filter(|c| c.enriched).count();
        assert_eq!(enriched, 3);
        // Ranked by interaction count: the most-interacted NPC first.
        assert_eq!(cards[0].name, "npc5");
        assert!(cards[0].enriched);
        assert!(!cards[4].enriched);
        assert!(cards[4].milestones.is_empty());
    }

    #[test]
    fn null_cost_produces_no_cost_language() {
        let outcome = OutcomeRecord {
            success: SuccessTier::Critical,
            dc: 5,
            roll: 20,
            power_modifier: 20,
            cost: None,
            consequence: None,
        };
        let directive = PacingDirective::neutral();
        let inputs = KeyAnimatorInputs {
            window_render: "RECENT TURNS:\n",
            ranked_memories: &[],
            intent: Intent::Ability,
            player_input: "I cast a basic cleaning spell on my robe.",
            outcome: Some(&outcome),
            combat: None,
            voice_cards: &[],
            directive: &directive,
        };
        let block = build_dynamic_block(&inputs);
        assert!(!block.contains("COST:"));
        assert!(!block.contains("CONSEQUENCE:"));
        assert!(block.contains("Critical"));
    }

    #[test]
    fn non_null_cost_is_injected() {
        let outcome = OutcomeRecord {
            success: SuccessTier::Partial,
            dc: 12,
            roll: 9,
            power_modifier: 0,
            cost: Some(ResourceCost { hp: 0, mp: 3, sp: 0 }),
            consequence: Some("something is given up".to_string()),
        };
        let directive = PacingDirective::neutral();
        let inputs = KeyAnimatorInputs {
            window_render: "",
            ranked_memories: &[],
            intent: Intent::Ability,
            player_input: "I force the ward open.",
            outcome: Some(&outcome),
            combat: None,
            voice_cards: &[],
            directive: &directive,
        };
        let block = build_dynamic_block(&inputs);
        assert!(block.contains("COST: hp 0 / mp 3 / sp 0"));
        assert!(block.contains("CONSEQUENCE: something is given up"));
    }

    #[test]
    fn override_directive_is_marked_mandatory() {
        let mut directive = PacingDirective::neutral();
        directive.strength = DirectiveStrength::Override;
        let inputs = KeyAnimatorInputs {
            window_render: "",
            ranked_memories: &[],
            intent: Intent::Social,
            player_input: "hello",
            outcome: None,
            combat: None,
            voice_cards: &[],
            directive: &directive,
        };
        let block = build_dynamic_block(&inputs);
        assert!(block.contains("DIRECTOR (MANDATORY)"));
    }
}
