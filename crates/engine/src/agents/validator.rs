//! Narrative validator: the post-narrative sensibility check.
//!
//! Advisory only — it can trigger at most one soft retry of the key
//! animator, with the contradiction cited. Resource legality is the
//! resource guard's job, and entity extraction never re-validates.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_store::Npc;

use super::names;

pub const MAX_RETRIES: usize = 1;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Verdict {
    pub consistent: bool,
    /// Present when inconsistent: what the narrative got wrong, cited back
    /// to the animator on retry.
    pub contradiction: Option<String>,
}

impl Verdict {
    pub fn consistent() -> Self {
        Self {
            consistent: true,
            contradiction: None,
        }
    }
}

/// Check the draft narrative against NPC dispositions and active
/// world-state consequences. Degrades to "consistent" — a broken validator
/// must never block play.
pub async fn check(
    router: &LlmRouter,
    narrative: &str,
    present: &[Npc],
    situation: &str,
    active_threads: &[String],
) -> Verdict {
    let cast: Vec<String> = present
        .iter()
        .map(|npc| format!("{} (disposition: {})", npc.name, npc.disposition.as_str()))
        .collect();
    let system = format!(
        "Check a roleplay scene draft for state contradictions.\n\
         Established situation: {situation}\n\
         Active consequences/threads: {}\n\
         Cast and dispositions: {}\n\n\
         Flag ONLY hard contradictions: an NPC acting against their \
         established disposition without on-page cause (e.g. a hostile NPC \
         suddenly devoted), or a world-state fact the scene asserts that \
         conflicts with the consequences above. Tone and style are not your \
         concern.",
        active_threads.join("; "),
        cast.join(", "),
    );
    let call = AgentCall::new(names::NARRATIVE_VALIDATOR, system)
        .user(narrative.to_string())
        .max_tokens(192)
        .temperature(0.0);

    match router.complete_with_schema::<Verdict>(&call).await {
        Ok(verdict) => verdict,
        Err(err) => {
            warn!(error = %err, "narrative validator unavailable, accepting draft");
            Verdict::consistent()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_deserializes_both_ways() {
        let ok: Verdict = serde_json::from_value(serde_json::json!({
            "consistent": true, "contradiction": null
        }))
        .unwrap();
        assert!(ok.consistent);

        let bad: Verdict = serde_json::from_value(serde_json::json!({
            "consistent": false,
            "contradiction": "Rolf is hostile but embraces the player as family"
        }))
        .unwrap();
        assert!(!bad.consistent);
        assert!(bad.contradiction.unwrap().contains("hostile"));
    }

    #[test]
    fn retry_budget_is_one() {
        assert_eq!(MAX_RETRIES, 1);
    }
}
