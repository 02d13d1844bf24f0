//! Static rule library.
//!
//! Guidance chunks keyed by composition axis, injected into the key
//! animator's stable prompt block. Process-wide, read-only after startup;
//! under prefix caching the per-turn token cost of carrying them is zero.

use aidm_profile::{NarrativeFocus, PowerExpression, TensionSource};

use crate::composition::EffectiveComposition;

pub fn tension_guidance(axis: TensionSource) -> &'static str {
    match axis {
        TensionSource::Existential => {
            "Tension comes from what the protagonist's existence means, not whether they survive. \
             Threats to identity, purpose, and time outweigh threats to the body."
        }
        TensionSource::Relational => {
            "Tension lives between people: trust extended or withheld, loyalties tested, \
             words unsaid. Physical stakes are a backdrop for relational ones."
        }
        TensionSource::Moral => {
            "Every meaningful choice trades one good against another. Let the cost of being \
             right be visible."
        }
        TensionSource::Burden => {
            "Power and history weigh on the carrier. Tension is the strain of holding up \
             what others cannot, and what it costs to keep carrying it."
        }
        TensionSource::Information => {
            "What is known, by whom, and when drives scenes. Reveals are currency; spend \
             them deliberately."
        }
        TensionSource::Consequence => {
            "Earlier choices come due. Let outcomes trace visibly back to what the player \
             did, not to fate."
        }
        TensionSource::Control => {
            "The struggle is over restraint: power held back, impulses mastered or not. \
             Losing control is the true failure state."
        }
        TensionSource::Emotional => {
            "Scenes succeed or fail on feeling. Track what each beat does to the heart of \
             the viewpoint character and of the reader."
        }
    }
}

pub fn expression_guidance(axis: PowerExpression) -> &'static str {
    match axis {
        PowerExpression::Instantaneous => {
            "Power resolves instantly when used. No wind-up, no struggle; the drama is in \
             when and whether, never how hard."
        }
        PowerExpression::Overwhelming => {
            "When power is shown, it ends the question. Build anticipation before, show \
             aftermath after; the act itself is brief."
        }
        PowerExpression::Sealed => {
            "Strength is locked behind a seal or vow. Its release is an event with a cost, \
             never a convenience."
        }
        PowerExpression::Hidden => {
            "Observers must not see the full measure. Let competence leak in small tells \
             while the reader shares the secret."
        }
        PowerExpression::Conditional => {
            "Power obeys rules and preconditions. Honoring those rules on-page is what makes \
             victories feel earned."
        }
        PowerExpression::Derivative => {
            "Ability flows from a source that can be studied, borrowed, or cut off. Keep the \
             source's presence felt."
        }
        PowerExpression::Passive => {
            "Strength shows without being invoked: things simply go differently around the \
             character. Understate it; never narrate effort."
        }
        PowerExpression::Subtle => {
            "Effects are quiet and deniable. Prefer implication over display; spectacle \
             would break the register."
        }
        PowerExpression::Spectacle => {
            "Power is performance. Render scale, light, and sound; let bystanders react as \
             a chorus."
        }
    }
}

pub fn focus_guidance(axis: NarrativeFocus) -> &'static str {
    match axis {
        NarrativeFocus::Internal => {
            "The real plot is inside the protagonist. External events matter as mirrors of \
             the inner arc."
        }
        NarrativeFocus::Ensemble => {
            "Rotate the spotlight. Secondary cast get wants, scenes, and small arcs of \
             their own."
        }
        NarrativeFocus::ReverseEnsemble => {
            "The world reacts to the protagonist: scenes are built from other characters' \
             views of them."
        }
        NarrativeFocus::Episodic => {
            "Each scene tells a complete small story with its own shape, connected by \
             travel and time."
        }
        NarrativeFocus::Faction => {
            "Groups are characters. Track banners, interests, and the pressure they put on \
             individuals."
        }
        NarrativeFocus::Mundane => {
            "Daily life carries the weight. Meals, chores, and small kindnesses are content, \
             not filler."
        }
        NarrativeFocus::Competition => {
            "Structure beats around contests with visible rules and stakes. Rivals are \
             engines, not obstacles."
        }
        NarrativeFocus::Legacy => {
            "The past generation's deeds frame the present. Inheritance, memory, and \
             comparison drive meaning."
        }
        NarrativeFocus::Solo => {
            "Stay tight on one experience. Other characters exist as the protagonist meets \
             them, not beyond."
        }
    }
}

/// Render the resolved composition's guidance for Block 1.
pub fn composition_block(composition: &EffectiveComposition) -> String {
    format!(
        "NARRATIVE COMPOSITION ({mode}):\n\
         - Tension: {tension}\n\
         - Power on the page: {expression}\n\
         - Focus: {focus}",
        mode = composition.mode.label(),
        tension = tension_guidance(composition.tension_source),
        expression = expression_guidance(composition.power_expression),
        focus = focus_guidance(composition.narrative_focus),
    )
}

/// Scene guidance for the primary detected genre. Unknown genres get no
/// extra text rather than generic filler.
pub fn genre_guidance(genre: &str) -> Option<&'static str> {
    let guidance = match genre.to_ascii_lowercase().as_str() {
        "fantasy" => "Ground wonder in concrete sensory detail; magic has texture and weather.",
        "adventure" => "Keep geography real: travel costs time, places have approach and exit.",
        "action" => "Choreograph cause and effect; every exchange changes position or odds.",
        "drama" => "Let silences and reactions carry beats that dialogue would cheapen.",
        "comedy" => "Comedy comes from character logic taken seriously, not from jokes.",
        "romance" => "Progress in small increments of attention and risk, never announcements.",
        "mystery" => "Plant fair clues on-page before any reveal; the reader could have known.",
        "horror" => "Withhold; the unseen shape is worse than the shown one.",
        "slice of life" => "Let scenes end without resolution; meaning accrues across days.",
        _ => return None,
    };
    Some(guidance)
}
