//! Per-agent model routing and the high-level completion contract.
//!
//! The router is built once from process settings and is read-only after
//! init. Each call names its agent; the router resolves `(provider, model)`
//! and applies the layer's single-retry policy for retryable provider
//! errors. Anything beyond one retry is the orchestrator's business.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use aidm_config::Settings;

use crate::provider::{ChatOutcome, ChatRequest, Provider, ProviderClient};
use crate::{extract_json_output, ChatMessage, LlmError, Result, ToolCall, ToolSpec};

/// Agents routed to the cheap fast model unless explicitly assigned.
const FAST_AGENTS: &[&str] = &["intent_classifier", "director_micro"];

/// One agent invocation. `agent` must be the agent's canonical snake_case
/// identifier (`key_animator`, `outcome_judge`, `anime_research`, …).
#[derive(Debug, Clone)]
pub struct AgentCall {
    pub agent: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl AgentCall {
    pub fn new(agent: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            system: system.into(),
            messages: Vec::new(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }

    pub fn user(mut self, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::user(content));
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: TokenUsage,
    pub cache_hit_ratio: f32,
}

/// One round of tool use. The caller executes the handlers and resubmits
/// results as tool-role messages if it wants another round.
#[derive(Debug, Clone)]
pub struct ToolUseRound {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

pub struct LlmRouter {
    client: ProviderClient,
    default_route: (Provider, String),
    fast_route: (Provider, String),
    embedding_route: (Provider, String),
    agent_routes: BTreeMap<String, (Provider, String)>,
}

impl LlmRouter {
    pub fn from_settings(settings: &Settings) -> Self {
        let client = ProviderClient::new(
            settings.llm.ollama_base_url.clone(),
            settings.llm.openai_base_url.clone(),
        );
        let default_provider = Provider::from_settings(&settings.llm.provider);
        let agent_routes = settings
            .agents
            .iter()
            .map(|(name, assignment)| {
                (
                    name.clone(),
                    (Provider::from_settings(&assignment.provider), assignment.model.clone()),
                )
            })
            .collect();

        Self {
            client,
            default_route: (default_provider, settings.llm.model.clone()),
            fast_route: (default_provider, settings.llm.fast_model.clone()),
            embedding_route: (default_provider, settings.llm.embedding_model.clone()),
            agent_routes,
        }
    }

    /// Resolve the provider + model for a canonical agent name.
    pub fn resolve_agent(&self, agent_name: &str) -> (Provider, &str) {
        if let Some((provider, model)) = self.agent_routes.get(agent_name) {
            return (*provider, model.as_str());
        }
        if FAST_AGENTS.contains(&agent_name) {
            return (self.fast_route.0, self.fast_route.1.as_str());
        }
        (self.default_route.0, self.default_route.1.as_str())
    }

    // ── Completion contract ──────────────────────────────────────────────────

    pub async fn complete(&self, call: &AgentCall) -> Result<Completion> {
        let outcome = self.chat_with_retry(call, None, None).await?;
        Ok(to_completion(outcome))
    }

    /// Streaming completion: text deltas flow through `tx` as they arrive.
    pub async fn complete_stream(
        &self,
        call: &AgentCall,
        tx: mpsc::Sender<String>,
    ) -> Result<Completion> {
        let outcome = self.chat_with_retry(call, None, Some(tx)).await?;
        Ok(to_completion(outcome))
    }

    /// Schema-constrained extraction. The schemars-derived schema for `T` is
    /// appended to the system prompt; the reply is parsed as fenced or bare
    /// JSON. One internal repair round on parse failure, then
    /// [`LlmError::Schema`].
    pub async fn complete_with_schema<T>(&self, call: &AgentCall) -> Result<T>
    where
        T: JsonSchema + DeserializeOwned,
    {
        let schema = schemars::r#gen::SchemaGenerator::default().into_root_schema_for::<T>();
        let schema_json = serde_json::to_string(&schema)
            .map_err(|e| LlmError::Schema(format!("schema render: {e}")))?;

        let mut constrained = call.clone();
        constrained.system = format!(
            "{}\n\nRespond with a single JSON object conforming to this JSON Schema. \
             No prose outside the JSON.\nSchema:\n{schema_json}",
            call.system
        );

        let outcome = self.chat_with_retry(&constrained, None, None).await?;
        if let Some(parsed) = extract_json_output::<T>(&outcome.content) {
            return Ok(parsed);
        }

        debug!(agent = %call.agent, "schema parse failed, attempting repair round");
        constrained
            .messages
            .push(ChatMessage::assistant(outcome.content.clone()));
        constrained.messages.push(ChatMessage::user(
            "That reply did not parse as JSON matching the schema. \
             Respond again with ONLY the corrected JSON object.",
        ));

        let repaired = self.chat_with_retry(&constrained, None, None).await?;
        extract_json_output::<T>(&repaired.content).ok_or_else(|| {
            let preview: String = repaired.content.chars().take(200).collect();
            LlmError::Schema(format!(
                "agent {} output not coercible after repair: {preview}",
                call.agent,
            ))
        })
    }

    /// One tool-use round. Executing handlers and resubmitting results is
    /// the caller's responsibility.
    pub async fn complete_with_tools(
        &self,
        call: &AgentCall,
        tools: &[ToolSpec],
    ) -> Result<ToolUseRound> {
        let tools_json = crate::specs_to_tools_json(tools);
        let outcome = self.chat_with_retry(call, Some(&tools_json), None).await?;
        Ok(ToolUseRound {
            content: outcome.content,
            tool_calls: outcome.tool_calls,
            usage: TokenUsage {
                prompt_tokens: outcome.prompt_tokens,
                completion_tokens: outcome.completion_tokens,
            },
        })
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let (provider, model) = &self.embedding_route;
        self.client.embed(*provider, model, text).await
    }

    // ── Retry policy ─────────────────────────────────────────────────────────

    async fn chat_with_retry(
        &self,
        call: &AgentCall,
        tools: Option<&serde_json::Value>,
        tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatOutcome> {
        let (provider, model) = self.resolve_agent(&call.agent);
        let request = ChatRequest {
            model,
            system: &call.system,
            messages: &call.messages,
            tools,
            max_tokens: call.max_tokens,
            temperature: call.temperature,
        };

        let first = match &tx {
            Some(tx) => self.client.chat_stream(provider, &request, tx.clone()).await,
            None => self.client.chat(provider, &request).await,
        };
        let err = match first {
            Ok(outcome) => return Ok(outcome),
            Err(err) if err.is_retryable() => err,
            Err(err) => return Err(err),
        };

        let backoff = jittered_backoff();
        warn!(
            agent = %call.agent,
            error = %err,
            backoff_ms = backoff.as_millis() as u64,
            "retryable provider error, retrying once"
        );
        tokio::time::sleep(backoff).await;

        match tx {
            Some(tx) => self.client.chat_stream(provider, &request, tx).await,
            None => self.client.chat(provider, &request).await,
        }
    }
}

fn to_completion(outcome: ChatOutcome) -> Completion {
    Completion {
        content: outcome.content,
        usage: TokenUsage {
            prompt_tokens: outcome.prompt_tokens,
            completion_tokens: outcome.completion_tokens,
        },
        cache_hit_ratio: outcome.cache_hit_ratio,
    }
}

fn jittered_backoff() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(250..1000))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aidm_config::AgentModel;

    fn settings_with_agent(agent: &str, provider: &str, model: &str) -> Settings {
        let mut settings = Settings::default();
        settings.agents.insert(
            agent.to_string(),
            AgentModel {
                provider: provider.to_string(),
                model: model.to_string(),
            },
        );
        settings
    }

    #[test]
    fn explicit_assignment_wins() {
        let settings = settings_with_agent("key_animator", "openai", "gpt-4o");
        let router = LlmRouter::from_settings(&settings);
        let (provider, model) = router.resolve_agent("key_animator");
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, "gpt-4o");
    }

    #[test]
    fn fast_agents_use_fast_model_by_default() {
        let settings = Settings::default();
        let router = LlmRouter::from_settings(&settings);
        let (_, model) = router.resolve_agent("director_micro");
        assert_eq!(model, settings.llm.fast_model);
        let (_, model) = router.resolve_agent("intent_classifier");
        assert_eq!(model, settings.llm.fast_model);
    }

    #[test]
    fn unknown_agent_gets_default_model() {
        let settings = Settings::default();
        let router = LlmRouter::from_settings(&settings);
        let (_, model) = router.resolve_agent("anime_research");
        assert_eq!(model, settings.llm.model);
    }

    #[test]
    fn fast_agent_assignment_overrides_fast_route() {
        let settings = settings_with_agent("director_micro", "openai", "gpt-4o-mini");
        let router = LlmRouter::from_settings(&settings);
        let (provider, model) = router.resolve_agent("director_micro");
        assert_eq!(provider, Provider::OpenAi);
        assert_eq!(model, "gpt-4o-mini");
    }

    #[test]
    fn agent_call_builder_accumulates_messages() {
        let call = AgentCall::new("outcome_judge", "judge actions")
            .user("I pick the lock")
            .max_tokens(256)
            .temperature(0.2);
        assert_eq!(call.messages.len(), 1);
        assert_eq!(call.max_tokens, 256);
        assert!((call.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn backoff_stays_within_band() {
        for _ in 0..32 {
            let backoff = jittered_backoff();
            assert!(backoff >= Duration::from_millis(250));
            assert!(backoff < Duration::from_millis(1000));
        }
    }
}
