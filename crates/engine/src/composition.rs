//! Composition layer: power differential and effective narrative framing.
//!
//! Differential = world tier number − character tier number, where lower
//! tier numbers are stronger. The mode selector blends the profile's
//! IP-level composition with the character's OP axis overrides; mode
//! changes only take hold at director-detected scene boundaries to avoid
//! per-turn whiplash.

use aidm_profile::{
    NarrativeFocus, NarrativeProfile, PowerExpression, TensionSource, parse_tier,
};
use aidm_store::Character;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NarrativeMode {
    /// |diff| ≤ 1: the profile composition stands alone.
    Standard,
    /// 2 ≤ diff ≤ 3: profile baseline, OP overrides layer onto tension and
    /// expression; focus always stays with the profile.
    Blended,
    /// diff ≥ 4: the character's OP axes lead.
    OpDominant,
}

impl NarrativeMode {
    pub fn label(self) -> &'static str {
        match self {
            NarrativeMode::Standard => "standard",
            NarrativeMode::Blended => "blended",
            NarrativeMode::OpDominant => "OP dominant",
        }
    }

    pub fn from_differential(differential: i64) -> Self {
        if differential >= 4 {
            NarrativeMode::OpDominant
        } else if differential >= 2 {
            NarrativeMode::Blended
        } else {
            NarrativeMode::Standard
        }
    }
}

/// World tier minus character tier. Positive = the character is stronger
/// than the reference tier. Tolerates both `T3` and `tier_3` forms; an
/// unparseable tier contributes no differential.
pub fn power_differential(world_tier: &str, character_tier: &str) -> i64 {
    match (parse_tier(world_tier), parse_tier(character_tier)) {
        (Some(world), Some(character)) => world as i64 - character as i64,
        _ => 0,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveComposition {
    pub tension_source: TensionSource,
    pub power_expression: PowerExpression,
    pub narrative_focus: NarrativeFocus,
    pub mode: NarrativeMode,
}

/// Compute the scene's effective composition. `threat_tier` (from the
/// outcome judge's encounter context) replaces the world's typical tier
/// when an encounter is active.
pub fn compose(
    profile: &NarrativeProfile,
    character: &Character,
    threat_tier: Option<&str>,
) -> EffectiveComposition {
    let reference_tier = threat_tier.unwrap_or(&profile.power_distribution.typical_tier);
    let differential = power_differential(reference_tier, &character.power_tier);
    let mode = NarrativeMode::from_differential(differential);
    debug!(reference_tier, character_tier = %character.power_tier, differential, mode = mode.label(), "composition recalculated");

    let base = profile.composition;
    let op = character_op_axes(character);

    match mode {
        NarrativeMode::Standard => EffectiveComposition {
            tension_source: base.tension_source,
            power_expression: base.power_expression,
            narrative_focus: base.narrative_focus,
            mode,
        },
        NarrativeMode::Blended => EffectiveComposition {
            tension_source: op
                .filter(|_| character.op_enabled)
                .and_then(|axes| axes.0)
                .unwrap_or(base.tension_source),
            power_expression: op
                .filter(|_| character.op_enabled)
                .and_then(|axes| axes.1)
                .unwrap_or(base.power_expression),
            // Focus always comes from the profile in blended mode.
            narrative_focus: base.narrative_focus,
            mode,
        },
        NarrativeMode::OpDominant => {
            let axes = op.unwrap_or((None, None, None));
            EffectiveComposition {
                tension_source: axes.0.unwrap_or(base.tension_source),
                power_expression: axes.1.unwrap_or(base.power_expression),
                narrative_focus: axes.2.unwrap_or(base.narrative_focus),
                mode,
            }
        }
    }
}

/// Apply a newly computed composition only at scene boundaries; otherwise
/// keep the previous one (the whiplash guard).
pub fn apply_at_boundary(
    previous: Option<EffectiveComposition>,
    next: EffectiveComposition,
    scene_boundary: bool,
) -> EffectiveComposition {
    match previous {
        Some(previous) if !scene_boundary && previous.mode != next.mode => previous,
        _ => next,
    }
}

type OpAxes = (
    Option<TensionSource>,
    Option<PowerExpression>,
    Option<NarrativeFocus>,
);

fn character_op_axes(character: &Character) -> Option<OpAxes> {
    if !character.op_enabled {
        return None;
    }
    Some((
        character
            .op_tension_source
            .as_deref()
            .and_then(parse_axis::<TensionSource>),
        character
            .op_power_expression
            .as_deref()
            .and_then(parse_axis::<PowerExpression>),
        character
            .op_narrative_focus
            .as_deref()
            .and_then(parse_axis::<NarrativeFocus>),
    ))
}

fn parse_axis<T: serde::de::DeserializeOwned>(value: &str) -> Option<T> {
    serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
}
