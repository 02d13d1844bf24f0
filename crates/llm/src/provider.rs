//! Provider wire clients.
//!
//! Two providers cover the deployment matrix: a local Ollama instance and
//! any OpenAI-compatible endpoint. Both are plain reqwest clients speaking
//! their native chat APIs; everything else in the crate is provider-blind.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use crate::{ChatMessage, ChatRole, LlmError, Result, ToolCall};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenAi,
}

impl Provider {
    /// Parse the settings string (`ollama` / `openai`). Unknown values fall
    /// back to Ollama so a typo degrades to the local model rather than a
    /// hard failure at startup.
    pub fn from_settings(name: &str) -> Self {
        if name.eq_ignore_ascii_case("openai") {
            Self::OpenAi
        } else {
            Self::Ollama
        }
    }
}

/// Raw outcome of one chat round, before router-level policy is applied.
#[derive(Debug, Clone, Default)]
pub struct ChatOutcome {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Fraction of the prompt served from the provider's prefix cache.
    /// Zero where the provider does not report it.
    pub cache_hit_ratio: f32,
}

/// Request shape shared by both providers.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub messages: &'a [ChatMessage],
    pub tools: Option<&'a serde_json::Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    ollama_base_url: String,
    openai_base_url: String,
}

impl ProviderClient {
    pub fn new(ollama_base_url: impl Into<String>, openai_base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(180))
            .build()
            .unwrap_or_default();
        Self {
            http,
            ollama_base_url: strip_trailing_slash(ollama_base_url.into()),
            openai_base_url: strip_trailing_slash(openai_base_url.into()),
        }
    }

    pub async fn chat(&self, provider: Provider, req: &ChatRequest<'_>) -> Result<ChatOutcome> {
        match provider {
            Provider::Ollama => self.ollama_chat(req, None).await,
            Provider::OpenAi => self.openai_chat(req, None).await,
        }
    }

    /// Chat with token streaming: text deltas are sent through `tx` as they
    /// arrive; the full outcome is returned at the end. Dropping the future
    /// cancels the in-flight request.
    pub async fn chat_stream(
        &self,
        provider: Provider,
        req: &ChatRequest<'_>,
        tx: mpsc::Sender<String>,
    ) -> Result<ChatOutcome> {
        match provider {
            Provider::Ollama => self.ollama_chat(req, Some(tx)).await,
            Provider::OpenAi => self.openai_chat(req, Some(tx)).await,
        }
    }

    pub async fn embed(&self, provider: Provider, model: &str, text: &str) -> Result<Vec<f32>> {
        match provider {
            Provider::Ollama => self.ollama_embed(model, text).await,
            Provider::OpenAi => self.openai_embed(model, text).await,
        }
    }

    // ── Ollama ───────────────────────────────────────────────────────────────

    async fn ollama_chat(
        &self,
        req: &ChatRequest<'_>,
        tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatOutcome> {
        let endpoint = format!("{}/api/chat", self.ollama_base_url);
        let streaming = tx.is_some();
        let mut payload = json!({
            "model": req.model,
            "messages": wire_messages(req.system, req.messages),
            "stream": streaming,
            "options": {
                "num_predict": req.max_tokens,
                "temperature": req.temperature,
            }
        });
        if let Some(tools) = req.tools {
            payload["tools"] = tools.clone();
        }

        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        if let Some(tx) = tx {
            return ollama_consume_stream(response, tx).await;
        }

        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        Ok(parse_ollama_body(&body))
    }

    async fn ollama_embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/api/embeddings", self.ollama_base_url);
        let payload = json!({ "model": model, "prompt": text });
        let response = self
            .http
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        let embedding = body
            .get("embedding")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
            .unwrap_or_default();
        Ok(embedding)
    }

    // ── OpenAI-compatible ────────────────────────────────────────────────────

    async fn openai_chat(
        &self,
        req: &ChatRequest<'_>,
        tx: Option<mpsc::Sender<String>>,
    ) -> Result<ChatOutcome> {
        let endpoint = format!("{}/chat/completions", self.openai_base_url);
        let streaming = tx.is_some();
        let mut payload = json!({
            "model": req.model,
            "messages": wire_messages(req.system, req.messages),
            "max_tokens": req.max_tokens,
            "temperature": req.temperature,
        });
        if streaming {
            payload["stream"] = json!(true);
            payload["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(tools) = req.tools {
            payload["tools"] = tools.clone();
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        if let Some(tx) = tx {
            return openai_consume_stream(response, tx).await;
        }

        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        Ok(parse_openai_body(&body))
    }

    async fn openai_embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let endpoint = format!("{}/embeddings", self.openai_base_url);
        let payload = json!({ "model": model, "input": text });
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key())
            .json(&payload)
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let body: serde_json::Value = response.json().await.map_err(transport_error)?;
        let embedding = body
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .map(|arr| arr.iter().filter_map(|x| x.as_f64()).map(|x| x as f32).collect())
            .unwrap_or_default();
        Ok(embedding)
    }
}

fn api_key() -> String {
    std::env::var("OPENAI_API_KEY").unwrap_or_default()
}

fn strip_trailing_slash(mut url: String) -> String {
    while url.ends_with('/') {
        url.pop();
    }
    url
}

fn transport_error(err: reqwest::Error) -> LlmError {
    LlmError::retryable(format!("transport: {err}"))
}

fn status_error(status: reqwest::StatusCode, body: &str) -> LlmError {
    let preview: String = body.chars().take(300).collect();
    let message = format!("HTTP {status}: {preview}");
    if status.as_u16() == 429 || status.is_server_error() {
        LlmError::retryable(message)
    } else {
        LlmError::permanent(message)
    }
}

// ── Wire format ──────────────────────────────────────────────────────────────

/// Render system + history into the shared role/content message array.
fn wire_messages(system: &str, messages: &[ChatMessage]) -> Vec<serde_json::Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system.is_empty() {
        out.push(json!({ "role": "system", "content": system }));
    }
    for msg in messages {
        let role = match msg.role {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::Tool => "tool",
        };
        let mut entry = json!({ "role": role });
        entry["content"] = match &msg.content {
            Some(content) => json!(content),
            None => serde_json::Value::Null,
        };
        if !msg.tool_calls.is_empty() {
            let calls: Vec<serde_json::Value> = msg
                .tool_calls
                .iter()
                .map(|tc| {
                    json!({
                        "id": tc.id,
                        "type": "function",
                        "function": {
                            "name": tc.name,
                            "arguments": tc.arguments.to_string(),
                        }
                    })
                })
                .collect();
            entry["tool_calls"] = json!(calls);
        }
        if let Some(id) = &msg.tool_call_id {
            entry["tool_call_id"] = json!(id);
        }
        out.push(entry);
    }
    out
}

// ── Response parsing ─────────────────────────────────────────────────────────

pub(crate) fn parse_ollama_body(body: &serde_json::Value) -> ChatOutcome {
    let content = body
        .pointer("/message/content")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = body
        .pointer("/message/tool_calls")
        .and_then(|v| v.as_array())
        .map(|calls| parse_tool_calls(calls))
        .unwrap_or_default();

    ChatOutcome {
        content,
        tool_calls,
        prompt_tokens: body.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        completion_tokens: body.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
        cache_hit_ratio: 0.0,
    }
}

pub(crate) fn parse_openai_body(body: &serde_json::Value) -> ChatOutcome {
    let message = body.pointer("/choices/0/message");
    let content = message
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| parse_tool_calls(calls))
        .unwrap_or_default();

    let prompt_tokens = body.pointer("/usage/prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let cached = body
        .pointer("/usage/prompt_tokens_details/cached_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let cache_hit_ratio = if prompt_tokens > 0 {
        cached as f32 / prompt_tokens as f32
    } else {
        0.0
    };

    ChatOutcome {
        content,
        tool_calls,
        prompt_tokens,
        completion_tokens: body
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_hit_ratio,
    }
}

/// Normalize tool calls from either wire shape: OpenAI nests under
/// `function` with string arguments, Ollama sends parsed objects.
fn parse_tool_calls(calls: &[serde_json::Value]) -> Vec<ToolCall> {
    calls
        .iter()
        .enumerate()
        .filter_map(|(i, call)| {
            let func = call.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func
                .get("arguments")
                .map(|v| {
                    if let Some(s) = v.as_str() {
                        serde_json::from_str(s).unwrap_or(json!({}))
                    } else {
                        v.clone()
                    }
                })
                .unwrap_or(json!({}));
            let id = call
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("call_{i}"));
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

// ── Streaming consumers ──────────────────────────────────────────────────────

async fn ollama_consume_stream(
    mut response: reqwest::Response,
    tx: mpsc::Sender<String>,
) -> Result<ChatOutcome> {
    let mut outcome = ChatOutcome::default();
    let mut buffer = String::new();

    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            if line.is_empty() {
                continue;
            }
            let Ok(frame) = serde_json::from_str::<serde_json::Value>(&line) else {
                continue;
            };
            if let Some(delta) = frame.pointer("/message/content").and_then(|v| v.as_str()) {
                if !delta.is_empty() {
                    outcome.content.push_str(delta);
                    let _ = tx.send(delta.to_string()).await;
                }
            }
            if frame.get("done").and_then(|v| v.as_bool()).unwrap_or(false) {
                outcome.prompt_tokens =
                    frame.get("prompt_eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
                outcome.completion_tokens =
                    frame.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(calls) = frame.pointer("/message/tool_calls").and_then(|v| v.as_array())
                {
                    outcome.tool_calls = parse_tool_calls(calls);
                }
            }
        }
    }

    Ok(outcome)
}

async fn openai_consume_stream(
    mut response: reqwest::Response,
    tx: mpsc::Sender<String>,
) -> Result<ChatOutcome> {
    let mut outcome = ChatOutcome::default();
    let mut buffer = String::new();
    // Tool-call deltas accumulate per index: (id, name, argument fragments).
    let mut call_parts: HashMap<usize, (String, String, String)> = HashMap::new();

    while let Some(chunk) = response.chunk().await.map_err(transport_error)? {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim().to_string();
            buffer.drain(..=newline);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let Ok(frame) = serde_json::from_str::<serde_json::Value>(data) else {
                continue;
            };

            if let Some(usage) = frame.get("usage").filter(|u| !u.is_null()) {
                outcome.prompt_tokens =
                    usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                outcome.completion_tokens =
                    usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let cached = usage
                    .pointer("/prompt_tokens_details/cached_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                if outcome.prompt_tokens > 0 {
                    outcome.cache_hit_ratio = cached as f32 / outcome.prompt_tokens as f32;
                }
            }

            let Some(delta) = frame.pointer("/choices/0/delta") else {
                continue;
            };
            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    outcome.content.push_str(text);
                    let _ = tx.send(text.to_string()).await;
                }
            }
            if let Some(tool_deltas) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                for td in tool_deltas {
                    let idx = td.get("index").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
                    let entry = call_parts.entry(idx).or_default();
                    if let Some(id) = td.get("id").and_then(|v| v.as_str()) {
                        entry.0 = id.to_string();
                    }
                    if let Some(name) = td.pointer("/function/name").and_then(|v| v.as_str()) {
                        entry.1 = name.to_string();
                    }
                    if let Some(args) = td.pointer("/function/arguments").and_then(|v| v.as_str()) {
                        entry.2.push_str(args);
                    }
                }
            }
        }
    }

    let mut indices: Vec<usize> = call_parts.keys().copied().collect();
    indices.sort_unstable();
    for idx in indices {
        let (id, name, args) = &call_parts[&idx];
        outcome.tool_calls.push(ToolCall {
            id: if id.is_empty() { format!("call_{idx}") } else { id.clone() },
            name: name.clone(),
            arguments: serde_json::from_str(args).unwrap_or(json!({})),
        });
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_openai_body_with_cached_tokens() {
        let body = json!({
            "choices": [{"message": {"content": "A hush falls over the hall."}}],
            "usage": {
                "prompt_tokens": 1000,
                "completion_tokens": 120,
                "prompt_tokens_details": {"cached_tokens": 800}
            }
        });
        let outcome = parse_openai_body(&body);
        assert_eq!(outcome.content, "A hush falls over the hall.");
        assert_eq!(outcome.prompt_tokens, 1000);
        assert!((outcome.cache_hit_ratio - 0.8).abs() < 1e-6);
    }

    #[test]
    fn parses_ollama_body_with_tool_calls() {
        let body = json!({
            "message": {
                "content": "",
                "tool_calls": [{
                    "function": {"name": "plant_seed", "arguments": {"description": "a stranger"}}
                }]
            },
            "prompt_eval_count": 42,
            "eval_count": 7
        });
        let outcome = parse_ollama_body(&body);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "plant_seed");
        assert_eq!(outcome.tool_calls[0].arguments["description"], "a stranger");
        assert_eq!(outcome.prompt_tokens, 42);
    }

    #[test]
    fn string_arguments_are_parsed_to_json() {
        let calls = json!([{
            "id": "call_9",
            "function": {"name": "set_current_location", "arguments": "{\"location\":\"docks\"}"}
        }]);
        let parsed = parse_tool_calls(calls.as_array().unwrap());
        assert_eq!(parsed[0].arguments["location"], "docks");
        assert_eq!(parsed[0].id, "call_9");
    }

    #[test]
    fn status_errors_classify_retryability() {
        assert!(status_error(reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down").is_retryable());
        assert!(status_error(reqwest::StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(!status_error(reqwest::StatusCode::BAD_REQUEST, "bad schema").is_retryable());
    }

    #[test]
    fn wire_messages_prepends_system() {
        let messages = vec![ChatMessage::user("hello")];
        let wire = wire_messages("be brief", &messages);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn provider_from_settings_is_lenient() {
        assert_eq!(Provider::from_settings("OpenAI"), Provider::OpenAi);
        assert_eq!(Provider::from_settings("ollama"), Provider::Ollama);
        assert_eq!(Provider::from_settings("mystery"), Provider::Ollama);
    }
}
