//! Outcome judge.
//!
//! Deterministic mechanics: a d20 roll against a DC assembled from scale,
//! relationship, and power-differential modifiers. Routine uses of
//! canonical powers by an OP character skip cost and consequence entirely;
//! only novel, risky, or stakes-bearing actions pay.

use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::guard::ResourceCost;

use super::intent::Intent;
use super::scales::ScaleResult;

/// Differential at or above which an action can be routine for an OP
/// character.
const OP_ROUTINE_DIFFERENTIAL: i64 = 4;
/// Risk below which an in-purview action counts as routine.
const OP_ROUTINE_RISK: f32 = 0.3;
const BASE_DC: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SuccessTier {
    Critical,
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub success: SuccessTier,
    pub dc: i64,
    pub roll: i64,
    pub power_modifier: i64,
    /// `None` means the animator must not invent cost language.
    pub cost: Option<ResourceCost>,
    pub consequence: Option<String>,
}

impl OutcomeRecord {
    /// Documented degraded output when judging inputs are unavailable: a
    /// neutral success at DC 10 with no cost.
    pub fn neutral() -> Self {
        Self {
            success: SuccessTier::Success,
            dc: BASE_DC,
            roll: BASE_DC,
            power_modifier: 0,
            cost: None,
            consequence: None,
        }
    }
}

/// Dice seam so tests are deterministic.
pub trait Roller: Send + Sync {
    fn roll_d20(&self) -> i64;
}

pub struct ThreadRngRoller;

impl Roller for ThreadRngRoller {
    fn roll_d20(&self) -> i64 {
        rand::thread_rng().gen_range(1..=20)
    }
}

/// Power-differential DC modifier: +5 per tier step of advantage once the
/// advantage reaches two tiers; a deficit of three or more applies a flat
/// −10.
pub fn power_modifier(differential: i64) -> i64 {
    if differential >= 2 {
        (differential - 1) * 5
    } else if differential <= -3 {
        -10
    } else {
        0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JudgeInputs {
    pub intent: Intent,
    pub risk: f32,
    pub scales: ScaleResult,
    pub differential: i64,
    pub op_enabled: bool,
    /// From NPC disposition when the action targets someone.
    pub relationship_modifier: i64,
    /// Guard verdict under `narrative_override_resources`.
    pub overdrawn: bool,
}

pub fn judge(inputs: &JudgeInputs, roller: &dyn Roller) -> OutcomeRecord {
    let modifier = power_modifier(inputs.differential);

    // Routine use of canonical power by an OP character: automatic, free.
    let routine = inputs.op_enabled
        && inputs.differential >= OP_ROUTINE_DIFFERENTIAL
        && inputs.risk < OP_ROUTINE_RISK
        && !inputs.overdrawn;
    if routine {
        return OutcomeRecord {
            success: SuccessTier::Critical,
            dc: 5,
            roll: 20,
            power_modifier: modifier,
            cost: None,
            consequence: None,
        };
    }

    let dc = (BASE_DC + inputs.scales.difficulty + inputs.scales.danger
        - inputs.relationship_modifier)
        .max(5);
    let roll = roller.roll_d20();
    let total = roll + modifier;

    let success = if total >= dc + 10 {
        SuccessTier::Critical
    } else if total >= dc {
        SuccessTier::Success
    } else if total >= dc - 5 {
        SuccessTier::Partial
    } else {
        SuccessTier::Failure
    };

    let cost = action_cost(inputs, success);
    let consequence = consequence_for(inputs, success);

    OutcomeRecord {
        success,
        dc,
        roll,
        power_modifier: modifier,
        cost,
        consequence,
    }
}

fn action_cost(inputs: &JudgeInputs, success: SuccessTier) -> Option<ResourceCost> {
    if !inputs.intent.is_mechanical() {
        return None;
    }
    // Criticals by a strong character stay free; everyone else pays for
    // effortful actions.
    if success == SuccessTier::Critical && inputs.differential >= 2 {
        return None;
    }
    let exertion = (inputs.scales.difficulty + inputs.scales.danger / 2).max(0) + 1;
    let cost = match inputs.intent {
        Intent::Ability => ResourceCost { hp: 0, mp: exertion, sp: 0 },
        Intent::Combat => ResourceCost { hp: 0, mp: 0, sp: exertion },
        _ => ResourceCost { hp: 0, mp: 0, sp: (exertion / 2).max(1) },
    };
    Some(cost)
}

fn consequence_for(inputs: &JudgeInputs, success: SuccessTier) -> Option<String> {
    if inputs.overdrawn {
        return Some(
            "The character is overdrawn; the effort visibly costs more than they had to give."
                .to_string(),
        );
    }
    match success {
        SuccessTier::Critical | SuccessTier::Success => None,
        SuccessTier::Partial => {
            Some("The attempt half-lands; something is given up to keep it.".to_string())
        }
        SuccessTier::Failure => {
            Some("The attempt fails and the situation worsens accordingly.".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRoller(i64);

    impl Roller for FixedRoller {
        fn roll_d20(&self) -> i64 {
            self.0
        }
    }

    fn inputs(intent: Intent, risk: f32, differential: i64, op: bool) -> JudgeInputs {
        JudgeInputs {
            intent,
            risk,
            scales: ScaleResult::neutral(),
            differential,
            op_enabled: op,
            relationship_modifier: 0,
            overdrawn: false,
        }
    }

    #[test]
    fn power_modifier_bands() {
        assert_eq!(power_modifier(0), 0);
        assert_eq!(power_modifier(1), 0);
        assert_eq!(power_modifier(2), 5);
        assert_eq!(power_modifier(5), 20);
        assert_eq!(power_modifier(-1), 0);
        assert_eq!(power_modifier(-2), 0);
        assert_eq!(power_modifier(-3), -10);
        assert_eq!(power_modifier(-6), -10);
    }

    #[test]
    fn op_routine_action_is_free_and_critical() {
        // T3 character, world typical T8: differential 5, trivial cleaning
        // spell at risk 0.1.
        let record = judge(&inputs(Intent::Ability, 0.1, 5, true), &FixedRoller(1));
        assert_eq!(record.success, SuccessTier::Critical);
        assert!(record.dc <= 5);
        assert_eq!(record.power_modifier, 20);
        assert!(record.cost.is_none());
        assert!(record.consequence.is_none());
    }

    #[test]
    fn op_character_at_extreme_differential_still_free() {
        let record = judge(&inputs(Intent::Ability, 0.0, 10, true), &FixedRoller(1));
        assert_eq!(record.success, SuccessTier::Critical);
        assert!(record.dc <= 5);
        assert!(record.cost.is_none() && record.consequence.is_none());
    }

    #[test]
    fn risky_op_action_is_not_routine() {
        let record = judge(&inputs(Intent::Ability, 0.8, 5, true), &FixedRoller(3));
        // Judged normally: rolls, and can cost.
        assert_ne!(record.dc, 5);
    }

    #[test]
    fn underpowered_character_gets_minus_ten_and_consequences() {
        // Differential -3: threat three tiers above the character.
        let record = judge(&inputs(Intent::Combat, 0.5, -3, false), &FixedRoller(8));
        assert_eq!(record.power_modifier, -10);
        // 8 - 10 = -2 vs DC 10: failure with cost and consequence.
        assert_eq!(record.success, SuccessTier::Failure);
        assert!(record.cost.is_some());
        assert!(record.consequence.is_some());
    }

    #[test]
    fn success_tiers_follow_roll_margins() {
        let base = inputs(Intent::Exploration, 0.4, 0, false);
        assert_eq!(judge(&base, &FixedRoller(20)).success, SuccessTier::Critical);
        assert_eq!(judge(&base, &FixedRoller(12)).success, SuccessTier::Success);
        assert_eq!(judge(&base, &FixedRoller(6)).success, SuccessTier::Partial);
        assert_eq!(judge(&base, &FixedRoller(2)).success, SuccessTier::Failure);
    }

    #[test]
    fn relationship_modifier_lowers_dc() {
        let mut friendly = inputs(Intent::Social, 0.2, 0, false);
        friendly.relationship_modifier = 4;
        let record = judge(&friendly, &FixedRoller(6));
        assert_eq!(record.dc, 6);
        assert_eq!(record.success, SuccessTier::Success);
    }

    #[test]
    fn overdrawn_actions_always_carry_a_consequence() {
        let mut overdrawn = inputs(Intent::Ability, 0.1, 5, true);
        overdrawn.overdrawn = true;
        let record = judge(&overdrawn, &FixedRoller(15));
        assert!(record.consequence.as_deref().unwrap().contains("overdrawn"));
    }

    #[test]
    fn neutral_degraded_output_matches_policy() {
        let record = OutcomeRecord::neutral();
        assert_eq!(record.dc, 10);
        assert!(record.cost.is_none());
        assert_eq!(record.success, SuccessTier::Success);
    }
}
