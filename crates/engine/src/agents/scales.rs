//! Scale selector: picks the outcome-judging axes for a non-trivial action.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};

use super::names;
use super::intent::IntentReport;

#[derive(Debug, Clone, Copy, Deserialize, JsonSchema)]
pub struct ScaleResult {
    /// DC modifier from task difficulty (-10 … +10).
    pub difficulty: i64,
    /// DC modifier from physical danger (-10 … +10).
    pub danger: i64,
    /// 0 throwaway … 10 arc-defining; drives the director's epicness
    /// accumulator.
    pub narrative_weight: i64,
}

impl ScaleResult {
    pub fn neutral() -> Self {
        Self {
            difficulty: 0,
            danger: 0,
            narrative_weight: 2,
        }
    }

    pub fn clamped(mut self) -> Self {
        self.difficulty = self.difficulty.clamp(-10, 10);
        self.danger = self.danger.clamp(-10, 10);
        self.narrative_weight = self.narrative_weight.clamp(0, 10);
        self
    }
}

pub async fn select_scales(
    router: &LlmRouter,
    player_input: &str,
    report: &IntentReport,
    situation: &str,
) -> ScaleResult {
    let system = format!(
        "Rate a roleplay action on three judging scales.\n\
         difficulty: how hard the task itself is, -10 (effortless) to +10 (near impossible).\n\
         danger: how badly failure could hurt, -10 (harmless) to +10 (lethal).\n\
         narrative_weight: 0 (throwaway) to 10 (arc-defining).\n\
         Intent: {}. Estimated risk: {:.1}.\nCurrent situation: {situation}",
        report.intent.as_str(),
        report.risk,
    );
    let call = AgentCall::new(names::SCALE_SELECTOR, system)
        .user(player_input)
        .max_tokens(192)
        .temperature(0.1);

    match router.complete_with_schema::<ScaleResult>(&call).await {
        Ok(result) => result.clamped(),
        Err(err) => {
            warn!(error = %err, "scale selector degraded to neutral scales");
            ScaleResult::neutral()
        }
    }
}
