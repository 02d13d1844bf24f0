//! Production agent: a single tool-use round after each committed turn.
//!
//! The agent reads the committed scene and decides autonomously which of
//! its tools to invoke. Tool handlers run here; failures are logged and
//! never reach the player.

use serde_json::Value;
use tracing::{info, warn};

use aidm_llm::{AgentCall, LlmRouter, ToolSpec};
use aidm_store::Store;

use crate::foreshadow::{NewSeed, SeedLedger};
use crate::Result;

use super::names;

pub fn tool_specs(media_enabled: bool) -> Vec<ToolSpec> {
    let mut specs = vec![
        ToolSpec {
            name: "plant_seed".to_string(),
            description: "Plant a foreshadowing seed to pay off in later scenes".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "description": {"type": "string"},
                    "expected_payoff": {"type": "string"},
                    "max_turns_to_payoff": {"type": "integer"},
                    "related_npcs": {"type": "array", "items": {"type": "string"}}
                },
                "required": ["description", "max_turns_to_payoff"]
            }),
        },
        ToolSpec {
            name: "complete_quest_objective".to_string(),
            description: "Mark a quest objective from the active threads as completed".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"objective": {"type": "string"}},
                "required": ["objective"]
            }),
        },
        ToolSpec {
            name: "upsert_location".to_string(),
            description: "Record a location the scene established or changed".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "description": {"type": "string"}
                },
                "required": ["name"]
            }),
        },
        ToolSpec {
            name: "set_current_location".to_string(),
            description: "Move the party's current location".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {"name": {"type": "string"}},
                "required": ["name"]
            }),
        },
    ];
    if media_enabled {
        specs.push(ToolSpec {
            name: "trigger_cutscene".to_string(),
            description: "Request a visual cutscene for an exceptional (sakuga) moment"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "kind": {"type": "string", "enum": ["image", "video"]}
                },
                "required": ["prompt", "kind"]
            }),
        });
    }
    specs
}

#[derive(Debug, Default)]
pub struct ProductionOutcome {
    pub seeds_planted: usize,
    pub cutscenes_requested: usize,
    pub actions: Vec<String>,
}

/// Budget context for the cutscene tool.
#[derive(Debug, Clone, Copy)]
pub struct MediaBudget {
    pub enabled: bool,
    pub budget_usd: f64,
    pub spent_usd: f64,
    pub estimated_cost_usd: f64,
}

impl MediaBudget {
    pub fn allows_cutscene(&self) -> bool {
        self.enabled && self.spent_usd + self.estimated_cost_usd <= self.budget_usd
    }
}

pub async fn run(
    router: &LlmRouter,
    store: &Store,
    ledger: &mut SeedLedger,
    campaign_id: i64,
    turn: i64,
    narrative: &str,
    active_threads: &[String],
    media: MediaBudget,
) -> Result<ProductionOutcome> {
    let specs = tool_specs(media.enabled);
    let system = format!(
        "You are the production agent for a long-form roleplay. Read the \
         committed scene and decide which tools to invoke, if any. Plant \
         seeds sparingly; trigger a cutscene only for a truly exceptional \
         visual moment.\nActive threads: {}",
        active_threads.join("; "),
    );
    let call = AgentCall::new(names::PRODUCTION, system)
        .user(narrative.to_string())
        .max_tokens(512)
        .temperature(0.3);

    let round = router.complete_with_tools(&call, &specs).await?;

    let mut outcome = ProductionOutcome::default();
    for tool_call in round.tool_calls {
        match dispatch(store, ledger, campaign_id, turn, &tool_call.name, &tool_call.arguments, media)
            .await
        {
            Ok(action) => {
                match tool_call.name.as_str() {
                    "plant_seed" => outcome.seeds_planted += 1,
                    "trigger_cutscene" => outcome.cutscenes_requested += 1,
                    _ => {}
                }
                outcome.actions.push(action);
            }
            Err(err) => warn!(tool = %tool_call.name, error = %err, "production tool failed"),
        }
    }
    if !outcome.actions.is_empty() {
        info!(turn, actions = outcome.actions.len(), "production agent acted");
    }
    Ok(outcome)
}

async fn dispatch(
    store: &Store,
    ledger: &mut SeedLedger,
    campaign_id: i64,
    turn: i64,
    tool: &str,
    args: &Value,
    media: MediaBudget,
) -> Result<String> {
    match tool {
        "plant_seed" => {
            let seed = NewSeed {
                description: str_arg(args, "description"),
                expected_payoff: str_arg(args, "expected_payoff"),
                max_turns_to_payoff: args
                    .get("max_turns_to_payoff")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(10),
                related_npcs: args
                    .get("related_npcs")
                    .and_then(|v| v.as_array())
                    .map(|arr| {
                        arr.iter()
                            .filter_map(|v| v.as_str())
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default(),
                ..NewSeed::default()
            };
            match ledger.plant(store, seed, turn).await? {
                Some(planted) => Ok(format!("planted seed {}", planted.id)),
                None => Ok("seed skipped (conflict active)".to_string()),
            }
        }
        "complete_quest_objective" => {
            let objective = str_arg(args, "objective");
            let mut bible = store.bible(campaign_id).await?;
            bible.active_threads.retain(|t| !t.eq_ignore_ascii_case(&objective));
            bible.resolved_threads.push(objective.clone());
            bible.bible_version += 1;
            store.save_bible(&bible).await?;
            Ok(format!("objective completed: {objective}"))
        }
        "upsert_location" => {
            let name = str_arg(args, "name");
            store
                .upsert_location(campaign_id, &name, &str_arg(args, "description"))
                .await?;
            Ok(format!("location recorded: {name}"))
        }
        "set_current_location" => {
            let name = str_arg(args, "name");
            let location = store.upsert_location(campaign_id, &name, "").await?;
            let mut world = store.world_state(campaign_id).await?;
            world.current_location_id = Some(location.id);
            store.save_world_state(&world).await?;
            Ok(format!("current location: {name}"))
        }
        "trigger_cutscene" => {
            if !media.allows_cutscene() {
                return Ok("cutscene skipped (budget or media disabled)".to_string());
            }
            let prompt = str_arg(args, "prompt");
            let kind = str_arg(args, "kind");
            store
                .insert_media(campaign_id, &kind, &prompt, media.estimated_cost_usd, turn)
                .await?;
            Ok(format!("cutscene requested: {kind}"))
        }
        other => Ok(format!("unknown tool ignored: {other}")),
    }
}

fn str_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
