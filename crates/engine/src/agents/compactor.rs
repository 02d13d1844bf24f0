//! Compactor: roll-off summaries and cold-memory compression text.

use schemars::JsonSchema;
use serde::Deserialize;
use tracing::warn;

use aidm_llm::{AgentCall, LlmRouter};
use aidm_memory::WindowTurn;

use super::names;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct SummaryOutput {
    summary: String,
}

/// Summarize a turn rolling off the sliding window in ~200 words,
/// preserving subtext (what was meant, feared, or implied — not just what
/// happened). Falls back to a truncation so the window never stalls.
pub async fn summarize_rolloff(router: &LlmRouter, turn: &WindowTurn) -> String {
    let system = "Summarize this roleplay exchange in at most 200 words. Preserve \
                  subtext: unspoken tensions, implications, and emotional undercurrents \
                  matter more than event order."
        .to_string();
    let call = AgentCall::new(names::COMPACTOR, system)
        .user(format!(
            "Player: {}\n\nScene:\n{}",
            turn.player_input, turn.narrative
        ))
        .max_tokens(320)
        .temperature(0.3);

    match router.complete_with_schema::<SummaryOutput>(&call).await {
        Ok(output) => output.summary,
        Err(err) => {
            warn!(error = %err, "rolloff summary degraded to truncation");
            fallback_summary(turn)
        }
    }
}

/// Summarize a cold-memory cluster into one compressed memory.
pub async fn summarize_cluster(
    router: &LlmRouter,
    cluster_key: &str,
    texts: &[String],
) -> String {
    let system = format!(
        "Compress these faded memories about '{cluster_key}' into one or two \
         sentences keeping only what could still matter to the story."
    );
    let call = AgentCall::new(names::COMPACTOR, system)
        .user(texts.join("\n"))
        .max_tokens(160)
        .temperature(0.3);

    match router.complete_with_schema::<SummaryOutput>(&call).await {
        Ok(output) => output.summary,
        Err(err) => {
            warn!(error = %err, "cluster summary degraded to join");
            format!("Faded memories about {cluster_key}: {}", texts.join(" / "))
        }
    }
}

fn fallback_summary(turn: &WindowTurn) -> String {
    let narrative: String = turn.narrative.chars().take(600).collect();
    format!("[turn {}] {} — {narrative}", turn.turn_number, turn.player_input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_keeps_turn_number_and_input() {
        let turn = WindowTurn {
            turn_number: 14,
            player_input: "I ask about the vault".to_string(),
            narrative: "x".repeat(2000),
        };
        let summary = fallback_summary(&turn);
        assert!(summary.contains("[turn 14]"));
        assert!(summary.contains("I ask about the vault"));
        assert!(summary.len() < 700);
    }
}
