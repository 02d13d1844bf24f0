//! Session zero: the phased pre-gameplay conversation.
//!
//! media detection → franchise disambiguation → research → calibration →
//! handoff. The phase persists in the sessions table so a half-finished
//! calibration survives a restart.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_profile::{NarrativeProfile, format_tier, parse_tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionZeroPhase {
    MediaDetection,
    Disambiguation,
    Research,
    Calibration,
    Handoff,
    /// Gameplay has begun; session zero is over.
    Play,
}

impl SessionZeroPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionZeroPhase::MediaDetection => "media_detection",
            SessionZeroPhase::Disambiguation => "disambiguation",
            SessionZeroPhase::Research => "research",
            SessionZeroPhase::Calibration => "calibration",
            SessionZeroPhase::Handoff => "handoff",
            SessionZeroPhase::Play => "play",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "media_detection" => Some(SessionZeroPhase::MediaDetection),
            "disambiguation" => Some(SessionZeroPhase::Disambiguation),
            "research" => Some(SessionZeroPhase::Research),
            "calibration" => Some(SessionZeroPhase::Calibration),
            "handoff" => Some(SessionZeroPhase::Handoff),
            "play" => Some(SessionZeroPhase::Play),
            _ => None,
        }
    }
}

/// Player's character as configured during calibration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CharacterDraft {
    pub name: String,
    /// Explicit tier override; `None` means derive at handoff.
    pub power_tier: Option<String>,
    pub op_enabled: bool,
    pub op_tension_source: Option<String>,
    pub op_power_expression: Option<String>,
    pub op_narrative_focus: Option<String>,
}

/// Handoff contract: the character's tier MUST come from the draft. When
/// the draft left it empty and OP mode is on, derive the world's peak as
/// `typical − op_gap` tiers (stronger). A non-OP empty draft plays at the
/// world's typical tier. Never a silent hardcoded default.
pub fn derive_power_tier(
    draft: &CharacterDraft,
    profile: &NarrativeProfile,
    op_tier_gap: u8,
) -> String {
    if let Some(tier) = &draft.power_tier {
        if parse_tier(tier).is_some() {
            return format_tier(parse_tier(tier).expect("checked"));
        }
    }
    let typical = parse_tier(&profile.power_distribution.typical_tier).unwrap_or(7);
    if draft.op_enabled {
        format_tier(typical.saturating_sub(op_tier_gap).max(1))
    } else {
        format_tier(typical)
    }
}

// ── Media detection ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct MediaDetection {
    /// The referenced media property, as close to its official title as the
    /// player's phrasing allows.
    pub media_reference: String,
    pub confident: bool,
}

pub async fn detect_media(router: &LlmRouter, player_input: &str) -> Option<String> {
    let system = "Extract which anime, manga, or film the player wants to roleplay in. \
                  Return the property title as close to official as their phrasing allows, \
                  and whether you are confident."
        .to_string();
    let call = AgentCall::new("media_detection", system)
        .user(player_input.to_string())
        .max_tokens(128)
        .temperature(0.0);

    match router.complete_with_schema::<MediaDetection>(&call).await {
        Ok(detection) if detection.confident && !detection.media_reference.is_empty() => {
            Some(detection.media_reference)
        }
        Ok(_) => None,
        Err(err) => {
            warn!(error = %err, "media detection failed, using raw input");
            let trimmed = player_input.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::sample_profile;

    #[test]
    fn phases_round_trip() {
        for phase in [
            SessionZeroPhase::MediaDetection,
            SessionZeroPhase::Disambiguation,
            SessionZeroPhase::Research,
            SessionZeroPhase::Calibration,
            SessionZeroPhase::Handoff,
            SessionZeroPhase::Play,
        ] {
            assert_eq!(SessionZeroPhase::parse(phase.as_str()), Some(phase));
        }
    }

    #[test]
    fn explicit_draft_tier_wins() {
        let profile = sample_profile("x");
        let draft = CharacterDraft {
            power_tier: Some("tier_2".to_string()),
            op_enabled: true,
            ..Default::default()
        };
        assert_eq!(derive_power_tier(&draft, &profile, 4), "T2");
    }

    #[test]
    fn empty_op_draft_derives_peak_from_typical_minus_gap() {
        // Typical T7, gap 4: the OP character lands at T3 — never a silent
        // hardcoded tier.
        let profile = sample_profile("x");
        let draft = CharacterDraft {
            op_enabled: true,
            ..Default::default()
        };
        assert_eq!(derive_power_tier(&draft, &profile, 4), "T3");
    }

    #[test]
    fn derivation_clamps_at_the_strongest_tier() {
        let mut profile = sample_profile("x");
        profile.power_distribution.typical_tier = "T3".to_string();
        let draft = CharacterDraft {
            op_enabled: true,
            ..Default::default()
        };
        assert_eq!(derive_power_tier(&draft, &profile, 4), "T1");
    }

    #[test]
    fn non_op_empty_draft_plays_at_typical() {
        let profile = sample_profile("x");
        let draft = CharacterDraft::default();
        assert_eq!(derive_power_tier(&draft, &profile, 4), "T7");
    }

    #[test]
    fn malformed_draft_tier_falls_back_to_derivation() {
        let profile = sample_profile("x");
        let draft = CharacterDraft {
            power_tier: Some("super strong".to_string()),
            op_enabled: false,
            ..Default::default()
        };
        assert_eq!(derive_power_tier(&draft, &profile, 4), "T7");
    }
}
