//! World builder: post-turn entity extraction and narrative-beat indexing.
//!
//! One background call emits new entities to upsert, two-to-three compact
//! narrative beats, and a plot-critical classification for auto-pinning.
//! It records only — NPC-behavior validation belongs to the narrative
//! validator, never here.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};

use super::names;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExtractedNpc {
    pub name: String,
    pub note: String,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExtractedPlace {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BeatKind {
    Emotional,
    DialogueHighlight,
    Sensory,
}

/// A 1–2 sentence texture memory for long-range callbacks. Stored with
/// slow decay and NPC/location tags.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct NarrativeBeat {
    pub kind: BeatKind,
    pub text: String,
    pub tagged_npcs: Vec<String>,
    pub tagged_locations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ExtractionReport {
    pub new_npcs: Vec<ExtractedNpc>,
    pub new_factions: Vec<ExtractedPlace>,
    pub new_locations: Vec<ExtractedPlace>,
    /// 2–3 beats per turn.
    pub beats: Vec<NarrativeBeat>,
    /// Binary classification: does this turn contain plot-critical
    /// information worth pinning?
    pub plot_critical: bool,
}

impl ExtractionReport {
    fn empty() -> Self {
        Self {
            new_npcs: Vec::new(),
            new_factions: Vec::new(),
            new_locations: Vec::new(),
            beats: Vec::new(),
            plot_critical: false,
        }
    }
}

pub async fn extract(
    router: &LlmRouter,
    narrative: &str,
    known_npcs: &[String],
    known_locations: &[String],
) -> ExtractionReport {
    let system = format!(
        "Extract world-state updates from a roleplay scene.\n\
         Known NPCs: {}.\nKnown locations: {}.\n\
         Report ONLY genuinely new named NPCs, factions, and locations.\n\
         Then write 2-3 narrative beats (1-2 sentences each) capturing \
         emotional, dialogue-highlight, or sensory texture worth recalling \
         many sessions later, tagged with the NPCs and locations involved.\n\
         Finally classify: does the scene reveal plot-critical information \
         (true/false)?",
        known_npcs.join(", "),
        known_locations.join(", "),
    );
    let call = AgentCall::new(names::WORLD_BUILDER, system)
        .user(narrative.to_string())
        .max_tokens(768)
        .temperature(0.2);

    match router.complete_with_schema::<ExtractionReport>(&call).await {
        Ok(mut report) => {
            report.beats.truncate(3);
            report
        }
        Err(err) => {
            warn!(error = %err, "entity extraction skipped this turn");
            ExtractionReport::empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_deserializes_from_model_shape() {
        let raw = serde_json::json!({
            "new_npcs": [{"name": "Hooded Stranger", "note": "Watched from the crowd"}],
            "new_factions": [],
            "new_locations": [{"name": "Harbor Gate", "description": "Northern entrance"}],
            "beats": [
                {"kind": "sensory", "text": "Rain pooled in the lantern light.",
                 "tagged_npcs": [], "tagged_locations": ["Harbor Gate"]},
                {"kind": "emotional", "text": "Fern hid her relief behind a scolding.",
                 "tagged_npcs": ["Fern"], "tagged_locations": []}
            ],
            "plot_critical": true
        });
        let report: ExtractionReport = serde_json::from_value(raw).unwrap();
        assert_eq!(report.new_npcs.len(), 1);
        assert_eq!(report.beats.len(), 2);
        assert!(report.plot_critical);
        assert_eq!(report.beats[0].kind, BeatKind::Sensory);
    }

    #[test]
    fn empty_report_is_inert() {
        let report = ExtractionReport::empty();
        assert!(report.new_npcs.is_empty());
        assert!(!report.plot_critical);
    }
}
