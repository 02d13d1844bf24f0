//! Resource guard: the pure-logic pre-check. Not an LLM.

use aidm_store::Character;
use serde::{Deserialize, Serialize};

use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ResourceCost {
    pub hp: i64,
    pub mp: i64,
    pub sp: i64,
}

impl ResourceCost {
    pub fn is_free(&self) -> bool {
        self.hp == 0 && self.mp == 0 && self.sp == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceGuard {
    /// When set, overdraw is reported to the judge instead of blocking;
    /// actual deltas clamp at zero in the commit.
    pub narrative_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardVerdict {
    Affordable,
    /// Allowed through under `narrative_override_resources`; the judge is
    /// told the character is overdrawn and must write a consequence.
    Overdrawn,
}

impl ResourceGuard {
    pub fn check(&self, character: &Character, cost: &ResourceCost) -> Result<GuardVerdict> {
        let affordable =
            character.hp >= cost.hp && character.mp >= cost.mp && character.sp >= cost.sp;
        if affordable {
            return Ok(GuardVerdict::Affordable);
        }
        if self.narrative_override {
            return Ok(GuardVerdict::Overdrawn);
        }
        Err(EngineError::ResourceInsufficient(format!(
            "action needs hp {}/mp {}/sp {}, character has hp {}/mp {}/sp {}",
            cost.hp, cost.mp, cost.sp, character.hp, character.mp, character.sp
        )))
    }

    /// Deltas to commit: the full cost when affordable, clamped to the
    /// available pool when overdrawn under the override.
    pub fn clamped_cost(&self, character: &Character, cost: &ResourceCost) -> ResourceCost {
        ResourceCost {
            hp: cost.hp.min(character.hp),
            mp: cost.mp.min(character.mp),
            sp: cost.sp.min(character.sp),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn character(hp: i64, mp: i64, sp: i64) -> Character {
        Character {
            id: 1,
            campaign_id: 1,
            name: "X".to_string(),
            power_tier: "T7".to_string(),
            level: 1,
            hp,
            mp,
            sp,
            op_enabled: false,
            op_tension_source: None,
            op_power_expression: None,
            op_narrative_focus: None,
        }
    }

    #[test]
    fn affordable_cost_passes() {
        let guard = ResourceGuard { narrative_override: false };
        let verdict = guard
            .check(&character(10, 10, 10), &ResourceCost { hp: 0, mp: 5, sp: 0 })
            .unwrap();
        assert_eq!(verdict, GuardVerdict::Affordable);
    }

    #[test]
    fn overdraw_blocks_without_override() {
        let guard = ResourceGuard { narrative_override: false };
        let result = guard.check(&character(10, 3, 10), &ResourceCost { hp: 0, mp: 5, sp: 0 });
        assert!(matches!(result, Err(EngineError::ResourceInsufficient(_))));
    }

    #[test]
    fn override_converts_block_to_overdrawn_verdict() {
        let guard = ResourceGuard { narrative_override: true };
        let verdict = guard
            .check(&character(10, 3, 10), &ResourceCost { hp: 0, mp: 5, sp: 0 })
            .unwrap();
        assert_eq!(verdict, GuardVerdict::Overdrawn);
    }

    #[test]
    fn clamped_cost_never_exceeds_the_pool() {
        let guard = ResourceGuard { narrative_override: true };
        let clamped = guard.clamped_cost(&character(10, 3, 0), &ResourceCost { hp: 2, mp: 9, sp: 4 });
        assert_eq!(clamped, ResourceCost { hp: 2, mp: 3, sp: 0 });
    }
}
