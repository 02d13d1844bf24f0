//! Relationship analyzer.
//!
//! Background pass over NPCs present in the committed scene: emotional
//! milestone detection via a structured call, plus the purely mechanical
//! intelligence-stage ladder. A stage transition queues a "previously
//! unseen behavior" micro-beat for the next scene.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_store::{IntelligenceStage, Npc};

use super::names;

/// Interaction counts at which an NPC's behavior deepens a stage.
const STAGE_THRESHOLDS: [(i64, IntelligenceStage); 3] = [
    (5, IntelligenceStage::Contextual),
    (12, IntelligenceStage::Anticipatory),
    (25, IntelligenceStage::Autonomous),
];

/// Milestone flags the analyzer may set. First-time-only: once set they
/// never clear.
pub const MILESTONES: &[&str] = &[
    "first_trust",
    "first_vulnerability",
    "first_conflict",
    "first_sacrifice",
    "first_secret_shared",
];

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MilestoneReport {
    /// Milestone keys newly reached in this scene, per NPC name.
    pub reached: Vec<NpcMilestone>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct NpcMilestone {
    pub npc: String,
    pub milestone: String,
}

/// Outcome of analyzing one NPC after a committed turn.
#[derive(Debug, Clone)]
pub struct RelationshipUpdate {
    pub npc_id: i64,
    pub new_milestones: Vec<String>,
    pub stage_transition: Option<IntelligenceStage>,
}

/// The mechanical half: stage advancement by sustained interaction.
pub fn stage_for_interactions(count: i64) -> IntelligenceStage {
    let mut stage = IntelligenceStage::Reactive;
    for (threshold, next) in STAGE_THRESHOLDS {
        if count >= threshold {
            stage = next;
        }
    }
    stage
}

pub async fn analyze(
    router: &LlmRouter,
    narrative: &str,
    present: &[Npc],
) -> Vec<RelationshipUpdate> {
    if present.is_empty() {
        return Vec::new();
    }

    let milestone_report = detect_milestones(router, narrative, present).await;

    present
        .iter()
        .map(|npc| {
            let new_milestones: Vec<String> = milestone_report
                .iter()
                .filter(|m| m.npc.eq_ignore_ascii_case(&npc.name))
                .map(|m| m.milestone.clone())
                .filter(|m| MILESTONES.contains(&m.as_str()) && !npc.milestones.contains(m))
                .collect();

            // Stages advance one step at a time even when the count would
            // justify jumping further.
            let deserved = stage_for_interactions(npc.interaction_count);
            let stage_transition = if deserved > npc.intelligence_stage {
                npc.intelligence_stage.next()
            } else {
                None
            };

            RelationshipUpdate {
                npc_id: npc.id,
                new_milestones,
                stage_transition,
            }
        })
        .collect()
}

async fn detect_milestones(
    router: &LlmRouter,
    narrative: &str,
    present: &[Npc],
) -> Vec<NpcMilestone> {
    let names: Vec<&str> = present.iter().map(|n| n.name.as_str()).collect();
    let system = format!(
        "Detect first-time emotional milestones in a roleplay scene.\n\
         Characters present: {}.\nMilestone keys: {}.\n\
         Report a milestone only when the scene clearly shows that moment \
         happening for the first time.",
        names.join(", "),
        MILESTONES.join(", "),
    );
    let call = AgentCall::new(names::RELATIONSHIP, system)
        .user(narrative.to_string())
        .max_tokens(256)
        .temperature(0.1);

    match router.complete_with_schema::<MilestoneReport>(&call).await {
        Ok(report) => report.reached,
        Err(err) => {
            warn!(error = %err, "milestone detection skipped this turn");
            Vec::new()
        }
    }
}

/// The micro-beat queued when an NPC crosses into a new stage.
pub fn stage_transition_beat(npc_name: &str, stage: IntelligenceStage) -> String {
    match stage {
        IntelligenceStage::Contextual => format!(
            "{npc_name} references something from a previous conversation unprompted."
        ),
        IntelligenceStage::Anticipatory => format!(
            "{npc_name} anticipates what the player needs before being asked."
        ),
        IntelligenceStage::Autonomous => format!(
            "{npc_name} acts on their own goals off-screen and mentions the result."
        ),
        IntelligenceStage::Reactive => format!("{npc_name} reacts simply and directly."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_ladder_follows_interaction_thresholds() {
        assert_eq!(stage_for_interactions(0), IntelligenceStage::Reactive);
        assert_eq!(stage_for_interactions(4), IntelligenceStage::Reactive);
        assert_eq!(stage_for_interactions(5), IntelligenceStage::Contextual);
        assert_eq!(stage_for_interactions(12), IntelligenceStage::Anticipatory);
        assert_eq!(stage_for_interactions(25), IntelligenceStage::Autonomous);
        assert_eq!(stage_for_interactions(400), IntelligenceStage::Autonomous);
    }

    #[test]
    fn transition_beats_describe_unseen_behavior() {
        let beat = stage_transition_beat("Fern", IntelligenceStage::Anticipatory);
        assert!(beat.contains("Fern"));
        assert!(beat.contains("anticipates"));
    }

    #[test]
    fn milestone_report_deserializes() {
        let raw = serde_json::json!({
            "reached": [{"npc": "Fern", "milestone": "first_trust"}]
        });
        let report: MilestoneReport = serde_json::from_value(raw).unwrap();
        assert_eq!(report.reached.len(), 1);
        assert_eq!(report.reached[0].milestone, "first_trust");
    }
}
