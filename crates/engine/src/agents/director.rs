//! Director: pre-turn micro-check and post-turn review.
//!
//! The micro-check is a fast-model structured call that runs concurrently
//! with memory retrieval and produces the turn's `PacingDirective`. The
//! post-turn review is a background task on a hybrid trigger that grows
//! the campaign bible.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_store::{ArcPhase, CampaignBible, WorldState};

use super::names;

/// Accumulated narrative weight that triggers a review on its own.
pub const EPICNESS_TRIGGER: f64 = 2.0;
/// Hard ceiling: a review always runs by this many turns.
pub const REVIEW_CEILING_TURNS: i64 = 8;
/// Reviews never run more often than this.
pub const REVIEW_FLOOR_TURNS: i64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveStrength {
    /// Soft bias.
    Suggestion,
    /// Strongly bias the animator.
    Strong,
    /// Hard constraint; the animator must comply.
    Override,
}

#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct PacingDirective {
    /// The beat this turn should land ("let the reunion breathe", "tighten
    /// the pursuit").
    pub arc_beat: String,
    /// Target tension 0.0–1.0 for the scene.
    pub escalation_target: f32,
    /// Threads or facts the narrative must touch.
    pub must_reference: Vec<String>,
    /// Topics to keep out of the scene.
    pub avoid: Vec<String>,
    /// Requested arc-phase transition (`rising_action`, `climax`, …).
    pub phase_transition: Option<String>,
    pub strength: DirectiveStrength,
}

impl PacingDirective {
    pub fn neutral() -> Self {
        Self {
            arc_beat: "continue the current beat".to_string(),
            escalation_target: 0.5,
            must_reference: Vec::new(),
            avoid: Vec::new(),
            phase_transition: None,
            strength: DirectiveStrength::Suggestion,
        }
    }

    pub fn requested_phase(&self) -> Option<ArcPhase> {
        self.phase_transition.as_deref().and_then(ArcPhase::parse)
    }

    /// Render for the animator's Block 2 / Block 3 use.
    pub fn render(&self) -> String {
        let mut out = format!(
            "PACING ({:?}): {} Target tension {:.1}.",
            self.strength, self.arc_beat, self.escalation_target
        );
        if !self.must_reference.is_empty() {
            out.push_str(&format!(" Must reference: {}.", self.must_reference.join("; ")));
        }
        if !self.avoid.is_empty() {
            out.push_str(&format!(" Avoid: {}.", self.avoid.join("; ")));
        }
        if let Some(phase) = &self.phase_transition {
            out.push_str(&format!(
                " Write a turning-point beat moving the arc into {phase}."
            ));
        }
        out
    }
}

/// Pre-turn micro-check. Degrades to a neutral suggestion so the turn
/// never blocks on pacing.
pub async fn micro_check(
    router: &LlmRouter,
    bible: &CampaignBible,
    world: &WorldState,
    last_narrative: &str,
    player_input: &str,
) -> PacingDirective {
    let threads = bible.active_threads.join("; ");
    let system = format!(
        "You are the pacing director for a long-form roleplay.\n\
         Arc phase: {} (turn {} in phase). Tension: {:.2}.\n\
         Situation: {}\nActive threads: {threads}\n\
         Last scene:\n{}\n\n\
         Produce a pacing directive for the NEXT scene: the beat to land, a \
         target tension, anything that must be referenced or avoided, and \
         optionally a phase_transition (one of setup, rising_action, climax, \
         resolution, epilogue) with strength suggestion|strong|override.",
        world.arc_phase.as_str(),
        world.turns_in_phase,
        world.tension_level,
        world.situation,
        truncate(last_narrative, 800),
    );
    let call = AgentCall::new(names::DIRECTOR_MICRO, system)
        .user(player_input.to_string())
        .max_tokens(256)
        .temperature(0.2);

    match router.complete_with_schema::<PacingDirective>(&call).await {
        Ok(directive) => directive,
        Err(err) => {
            warn!(error = %err, "director micro-check degraded to neutral directive");
            PacingDirective::neutral()
        }
    }
}

// ── Post-turn review ─────────────────────────────────────────────────────────

/// Hybrid trigger: epicness threshold OR an arc-relevant event OR the turn
/// ceiling, never more often than the floor.
pub fn should_review(
    accumulated_epicness: f64,
    arc_event_occurred: bool,
    turns_since_review: i64,
) -> bool {
    if turns_since_review < REVIEW_FLOOR_TURNS {
        return false;
    }
    accumulated_epicness >= EPICNESS_TRIGGER
        || arc_event_occurred
        || turns_since_review >= REVIEW_CEILING_TURNS
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct SeedRecommendation {
    pub description: String,
    pub expected_payoff: String,
    pub max_turns_to_payoff: i64,
    pub related_npcs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct PostReview {
    /// Appended to `arc_history` with the turn number.
    pub arc_summary: String,
    pub active_threads: Vec<String>,
    pub resolved_threads: Vec<String>,
    /// Regenerated from active consequences, not from scratch.
    pub situation: String,
    pub seed_recommendations: Vec<SeedRecommendation>,
    pub spotlight_notes: Vec<String>,
}

pub async fn post_review(
    router: &LlmRouter,
    bible: &CampaignBible,
    world: &WorldState,
    recent_narratives: &str,
) -> Option<PostReview> {
    let system = format!(
        "You are the reviewing director. Update the campaign bible from the \
         recent scenes.\n\
         Current situation: {}\nActive threads: {}\nArc phase: {}\n\n\
         RECENT SCENES:\n{}\n\n\
         Produce: a one-paragraph arc_summary of what changed; the updated \
         active_threads and any resolved_threads; a rewritten situation \
         grounded in active consequences; up to two seed_recommendations for \
         foreshadowing worth planting; and spotlight_notes for cast members \
         who deserve the next scenes.",
        world.situation,
        bible.active_threads.join("; "),
        world.arc_phase.as_str(),
        truncate(recent_narratives, 4000),
    );
    let call = AgentCall::new(names::DIRECTOR_REVIEW, system)
        .user("Review and update the bible.")
        .max_tokens(1024)
        .temperature(0.4);

    match router.complete_with_schema::<PostReview>(&call).await {
        Ok(review) => Some(review),
        Err(err) => {
            warn!(error = %err, "director post-review failed, bible unchanged");
            None
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_directive_is_a_suggestion_without_transition() {
        let directive = PacingDirective::neutral();
        assert_eq!(directive.strength, DirectiveStrength::Suggestion);
        assert!(directive.requested_phase().is_none());
    }

    #[test]
    fn requested_phase_parses_known_phases_only() {
        let mut directive = PacingDirective::neutral();
        directive.phase_transition = Some("climax".to_string());
        assert_eq!(directive.requested_phase(), Some(ArcPhase::Climax));
        directive.phase_transition = Some("intermission".to_string());
        assert_eq!(directive.requested_phase(), None);
    }

    #[test]
    fn review_trigger_honors_floor_epicness_and_ceiling() {
        // Floor: never before 3 turns, whatever else happened.
        assert!(!should_review(10.0, true, 2));
        // Epicness threshold.
        assert!(should_review(2.0, false, 3));
        assert!(!should_review(1.9, false, 3));
        // Arc event.
        assert!(should_review(0.0, true, 3));
        // Ceiling of 8 turns.
        assert!(should_review(0.0, false, 8));
        assert!(!should_review(0.0, false, 7));
    }

    #[test]
    fn render_includes_transition_demand() {
        let mut directive = PacingDirective::neutral();
        directive.phase_transition = Some("climax".to_string());
        directive.strength = DirectiveStrength::Override;
        directive.must_reference = vec!["the sealed vault".to_string()];
        let rendered = directive.render();
        assert!(rendered.contains("Override"));
        assert!(rendered.contains("turning-point"));
        assert!(rendered.contains("sealed vault"));
    }
}
