//! Uniform LLM capability layer.
//!
//! One contract — text completion, schema-constrained extraction, tool use,
//! embeddings — over multiple providers, with per-agent model routing read
//! from process settings. Providers are wired once here; everything above
//! this crate speaks [`ChatMessage`] and [`LlmRouter`].

mod blocks;
mod provider;
mod router;

pub use blocks::PromptBlocks;
pub use provider::{Provider, ProviderClient};
pub use router::{AgentCall, Completion, LlmRouter, TokenUsage, ToolUseRound};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport, rate-limit, or provider-side failure. `retryable` drives
    /// the single internal retry and the orchestrator's degradation policy.
    #[error("provider error (retryable={retryable}): {message}")]
    Provider { message: String, retryable: bool },

    /// Structured extraction could not be coerced to the requested schema,
    /// even after one repair round.
    #[error("schema validation failed: {0}")]
    Schema(String),

    /// Cooperative cancellation of an in-flight call.
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Provider {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider { retryable: true, .. })
    }
}

// ── Chat message model ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in a chat conversation, in the shape both wire formats
/// (Ollama `/api/chat`, OpenAI `/chat/completions`) understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: None,
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// A tool call requested by the model. Arguments are normalized to a parsed
/// JSON value regardless of whether the provider sent a string or an object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Static description of a tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Render tool specs as the OpenAI-compatible `tools` array.
pub fn specs_to_tools_json(specs: &[ToolSpec]) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = specs
        .iter()
        .map(|spec| {
            serde_json::json!({
                "type": "function",
                "function": {
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                }
            })
        })
        .collect();
    serde_json::Value::Array(entries)
}

// ── Structured output extraction ─────────────────────────────────────────────

/// Extract the first JSON payload from a model reply: a fenced ```json block
/// if present, otherwise the outermost bare `{…}` span.
pub fn extract_json_output<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(json_start) = after_fence.find(|c: char| !c.is_whitespace()) {
            let json_body = &after_fence[json_start..];
            if let Some(fence_end) = json_body.find("```") {
                let json_str = json_body[..fence_end].trim();
                if let Ok(val) = serde_json::from_str(json_str) {
                    return Some(val);
                }
            }
        }
    }

    let trimmed = response.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(val) = serde_json::from_str(&trimmed[start..=end]) {
                return Some(val);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, serde::Deserialize)]
    struct Sample {
        intent: String,
        risk: f32,
    }

    #[test]
    fn extracts_fenced_json() {
        let raw = "Here you go:\n```json\n{\"intent\":\"combat\",\"risk\":0.7}\n```\nDone.";
        let out: Sample = extract_json_output(raw).unwrap();
        assert_eq!(out.intent, "combat");
        assert!((out.risk - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn extracts_bare_json_with_surrounding_text() {
        let raw = "classification: {\"intent\":\"social\",\"risk\":0.1} as requested";
        let out: Sample = extract_json_output(raw).unwrap();
        assert_eq!(out.intent, "social");
    }

    #[test]
    fn fenced_block_takes_precedence_over_bare_object() {
        let raw = "{\"intent\":\"wrong\",\"risk\":0.0}\n```json\n{\"intent\":\"right\",\"risk\":1.0}\n```";
        let out: Sample = extract_json_output(raw).unwrap();
        assert_eq!(out.intent, "right");
    }

    #[test]
    fn returns_none_for_plain_text() {
        assert!(extract_json_output::<Sample>("no json here").is_none());
    }

    #[test]
    fn tool_specs_render_as_openai_array() {
        let specs = vec![ToolSpec {
            name: "plant_seed".to_string(),
            description: "Plant a foreshadowing seed".to_string(),
            parameters: serde_json::json!({"type": "object"}),
        }];
        let tools = specs_to_tools_json(&specs);
        assert_eq!(tools[0]["function"]["name"], "plant_seed");
        assert_eq!(tools[0]["type"], "function");
    }

    #[test]
    fn error_classification_round_trip() {
        assert!(LlmError::retryable("rate limited").is_retryable());
        assert!(!LlmError::permanent("bad request").is_retryable());
        assert!(!LlmError::Schema("nope".into()).is_retryable());
    }
}
