//! Combat agent: mechanical pre-resolution before any narrative.
//!
//! The key animator receives this result as authoritative input — it
//! narrates what already happened mechanically, never the other way
//! around.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_profile::CombatStyle;
use aidm_store::Character;

use crate::composition::power_differential;
use crate::guard::ResourceCost;

use super::names;
use super::outcome::{Roller, power_modifier};

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CombatResult {
    pub hit: bool,
    pub damage_taken: i64,
    pub damage_dealt: i64,
    pub resource_cost: ResourceCost,
    pub enemy_defeated: bool,
    pub character_downed: bool,
    /// One-line mechanical summary for the animator's dynamic block.
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct CombatContext<'a> {
    pub character: &'a Character,
    pub threat_tier: &'a str,
    pub combat_style: CombatStyle,
    pub player_input: &'a str,
}

/// Resolve one combat exchange mechanically. Dice decide hits and damage;
/// the model is consulted only to phrase the summary, and its failure
/// falls back to a plain template.
pub async fn resolve(
    router: &LlmRouter,
    ctx: &CombatContext<'_>,
    roller: &dyn Roller,
) -> CombatResult {
    let differential = power_differential(ctx.threat_tier, &ctx.character.power_tier);
    let modifier = power_modifier(differential);
    let attack = roller.roll_d20() + modifier;
    let hit = attack >= 10;

    let damage_dealt = if hit {
        (4 + differential.max(0) * 2).max(1)
    } else {
        0
    };
    let damage_taken = if differential < 0 {
        (-differential * 2).min(ctx.character.hp)
    } else if !hit {
        2.min(ctx.character.hp)
    } else {
        0
    };
    let enemy_defeated = hit && differential >= 2;
    let character_downed = damage_taken >= ctx.character.hp;

    let resource_cost = ResourceCost {
        hp: damage_taken,
        mp: if ctx.combat_style == CombatStyle::Magical { 2 } else { 0 },
        sp: 1,
    };

    let summary = match summarize(router, ctx, hit, damage_dealt, damage_taken).await {
        Some(summary) => summary,
        None => format!(
            "{}: {} (dealt {damage_dealt}, took {damage_taken})",
            ctx.character.name,
            if hit { "landed the exchange" } else { "missed the exchange" },
        ),
    };

    CombatResult {
        hit,
        damage_taken,
        damage_dealt,
        resource_cost,
        enemy_defeated,
        character_downed,
        summary,
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct CombatSummary {
    summary: String,
}

async fn summarize(
    router: &LlmRouter,
    ctx: &CombatContext<'_>,
    hit: bool,
    dealt: i64,
    taken: i64,
) -> Option<String> {
    let system = format!(
        "Summarize a combat exchange in one mechanical sentence (no prose \
         flourish). Style: {:?}. Hit: {hit}. Damage dealt: {dealt}. Damage \
         taken: {taken}.",
        ctx.combat_style
    );
    let call = AgentCall::new(names::COMBAT, system)
        .user(ctx.player_input.to_string())
        .max_tokens(96)
        .temperature(0.2);
    match router.complete_with_schema::<CombatSummary>(&call).await {
        Ok(summary) => Some(summary.summary),
        Err(err) => {
            warn!(error = %err, "combat summary degraded to template");
            None
        }
    }
}
