//! Intent classifier.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};

use super::names;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Combat,
    Ability,
    Social,
    Exploration,
    LoreQuestion,
    Meta,
    Trivial,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::Combat => "combat",
            Intent::Ability => "ability",
            Intent::Social => "social",
            Intent::Exploration => "exploration",
            Intent::LoreQuestion => "lore_question",
            Intent::Meta => "meta",
            Intent::Trivial => "trivial",
        }
    }

    /// Page-type filter for lore retrieval when the intent maps cleanly.
    pub fn page_type_filter(self) -> Option<&'static str> {
        match self {
            Intent::Combat | Intent::Ability => Some("TECHNIQUE"),
            Intent::Social => Some("CHARACTER"),
            Intent::LoreQuestion => Some("WORLDBUILDING"),
            Intent::Exploration => Some("LOCATION"),
            Intent::Meta | Intent::Trivial => None,
        }
    }

    /// Trivial turns skip the outcome judge and mutate nothing mechanical.
    pub fn is_mechanical(self) -> bool {
        !matches!(self, Intent::Meta | Intent::Trivial | Intent::LoreQuestion)
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct IntentReport {
    pub intent: Intent,
    /// 0.0 routine … 1.0 reckless.
    pub risk: f32,
    pub present_npcs: Vec<String>,
}

impl IntentReport {
    pub fn trivial() -> Self {
        Self {
            intent: Intent::Trivial,
            risk: 0.0,
            present_npcs: Vec::new(),
        }
    }
}

/// Classify the player's input. Empty input short-circuits to Trivial
/// without a model call; a double provider failure degrades to a Social
/// guess so the turn survives.
pub async fn classify(
    router: &LlmRouter,
    player_input: &str,
    known_npcs: &[String],
) -> IntentReport {
    let trimmed = player_input.trim();
    if trimmed.is_empty() {
        return IntentReport::trivial();
    }

    let system = format!(
        "Classify a roleplay player's action.\n\
         Intents: combat (attacking), ability (using a power non-violently), \
         social (talking, persuading), exploration (moving, searching), \
         lore_question (asking about the world), meta (out-of-character), \
         trivial (no meaningful action).\n\
         Known NPCs: {}.\n\
         Estimate risk 0.0 (routine) to 1.0 (reckless) and list which known \
         NPCs the action involves.",
        known_npcs.join(", ")
    );
    let call = AgentCall::new(names::INTENT_CLASSIFIER, system)
        .user(trimmed)
        .max_tokens(256)
        .temperature(0.0);

    match router.complete_with_schema::<IntentReport>(&call).await {
        Ok(report) => report,
        Err(err) => {
            warn!(error = %err, "intent classifier degraded to social/low-risk");
            IntentReport {
                intent: Intent::Social,
                risk: 0.2,
                present_npcs: Vec::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_type_filters_follow_intent() {
        assert_eq!(Intent::Combat.page_type_filter(), Some("TECHNIQUE"));
        assert_eq!(Intent::Ability.page_type_filter(), Some("TECHNIQUE"));
        assert_eq!(Intent::Social.page_type_filter(), Some("CHARACTER"));
        assert_eq!(Intent::LoreQuestion.page_type_filter(), Some("WORLDBUILDING"));
        assert_eq!(Intent::Exploration.page_type_filter(), Some("LOCATION"));
        assert_eq!(Intent::Meta.page_type_filter(), None);
    }

    #[test]
    fn mechanical_intents_exclude_questions_and_meta() {
        assert!(Intent::Combat.is_mechanical());
        assert!(Intent::Ability.is_mechanical());
        assert!(!Intent::Trivial.is_mechanical());
        assert!(!Intent::Meta.is_mechanical());
        assert!(!Intent::LoreQuestion.is_mechanical());
    }

    #[test]
    fn trivial_report_is_inert() {
        let report = IntentReport::trivial();
        assert_eq!(report.intent, Intent::Trivial);
        assert_eq!(report.risk, 0.0);
        assert!(report.present_npcs.is_empty());
    }
}
