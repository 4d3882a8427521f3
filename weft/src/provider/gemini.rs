//! Gemini native dialect: `POST {base}/v1beta/models/{model}:generateContent`.
//!
//! Gemini has no tool-call ids; calls are matched positionally, so ids are
//! synthesized (`call_*`) and the function name rides back with the
//! `functionResponse` part. Roles are `user`/`model` and the system prompt
//! is a separate `system_instruction` field.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use super::sse::SseParser;
use super::{
    classify_status_error, classify_transport_error, ChunkSink, CompletionRequest,
    CompletionResponse, LlmProvider, Usage, DEFAULT_PROVIDER_TIMEOUT,
};
use crate::error::{ErrorCode, WeftError};
use crate::message::{Message, Role, ToolCall};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(name: &str, settings: &config::ProviderSettings) -> Result<Self, WeftError> {
        let timeout = settings
            .timeout_seconds
            .map(std::time::Duration::from_secs)
            .unwrap_or(DEFAULT_PROVIDER_TIMEOUT);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                WeftError::new(ErrorCode::ProviderInvalid, "failed to build HTTP client")
                    .with_cause(e)
            })?;
        Ok(Self {
            name: name.to_string(),
            api_key: settings.resolve_api_key().unwrap_or_default(),
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings
                .default_model
                .clone()
                .unwrap_or_else(|| "gemini-2.0-flash".to_string()),
            client,
        })
    }
}

pub(crate) fn build_body(request: &CompletionRequest) -> Value {
    let mut body = json!({ "contents": wire_contents(&request.messages) });
    if let Some(system) = &request.system_prompt {
        body["system_instruction"] = json!({ "parts": [{ "text": system }] });
    }
    if !request.tools.is_empty() {
        let declarations: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "parameters": tool.function.parameters,
                })
            })
            .collect();
        body["tools"] = json!([{ "functionDeclarations": declarations }]);
    }
    let mut generation = serde_json::Map::new();
    if let Some(t) = request.temperature {
        generation.insert("temperature".into(), json!(t));
    }
    if let Some(m) = request.max_tokens {
        generation.insert("maxOutputTokens".into(), json!(m));
    }
    if !generation.is_empty() {
        body["generationConfig"] = Value::Object(generation);
    }
    body
}

fn wire_contents(messages: &[Message]) -> Vec<Value> {
    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System | Role::User => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{ "text": message.content_str() }],
                }));
            }
            Role::Assistant => {
                let mut parts: Vec<Value> = Vec::new();
                if let Some(content) = &message.content {
                    if !content.is_empty() {
                        parts.push(json!({ "text": content }));
                    }
                }
                for call in &message.tool_calls {
                    parts.push(json!({
                        "functionCall": {
                            "name": call.function.name,
                            "args": call.arguments_value().unwrap_or_else(|_| json!({})),
                        }
                    }));
                }
                contents.push(json!({ "role": "model", "parts": parts }));
            }
            Role::Tool => {
                contents.push(json!({
                    "role": "user",
                    "parts": [{
                        "functionResponse": {
                            "name": message.name.as_deref().unwrap_or("tool"),
                            "response": { "content": message.content_str() },
                        }
                    }],
                }));
            }
        }
    }
    contents
}

/// Reduces one generateContent response (or stream chunk) to text +
/// tool calls.
pub(crate) fn parse_candidate(body: &Value) -> (String, Vec<ToolCall>) {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    if let Some(parts) = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
    {
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                content.push_str(text);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall::new(
                    format!("call_{}", Uuid::new_v4().simple()),
                    name,
                    args.to_string(),
                ));
            }
        }
    }
    (content, tool_calls)
}

pub(crate) fn parse_usage(body: &Value) -> Option<Usage> {
    let usage = body.get("usageMetadata")?;
    Some(Usage {
        prompt_tokens: usage
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        completion_tokens: usage
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        total_tokens: usage
            .get("totalTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    })
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.model
    }

    async fn create_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, WeftError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!(
            "{}/v1beta/models/{model}:generateContent?key={}",
            self.base_url, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(&build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;
        if !status.is_success() {
            return Err(classify_status_error(&self.name, status.as_u16(), &text));
        }
        let parsed: Value = serde_json::from_str(&text).map_err(|e| {
            WeftError::new(ErrorCode::ProviderApiError, "unparseable provider response")
                .with_cause(e)
                .with_context("provider", &self.name)
        })?;

        let (content, tool_calls) = parse_candidate(&parsed);
        Ok(CompletionResponse {
            content,
            tool_calls,
            usage: parse_usage(&parsed),
            model: model.to_string(),
        })
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResponse, WeftError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let url = format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );
        let response = self
            .client
            .post(url)
            .json(&build_body(request))
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status_error(&self.name, status.as_u16(), &text));
        }

        let mut parser = SseParser::new();
        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| classify_transport_error(&self.name, e))?;
            for event in parser.feed(&bytes) {
                let Ok(parsed) = serde_json::from_str::<Value>(&event.data) else {
                    debug!(provider = %self.name, "skipping non-JSON SSE chunk");
                    continue;
                };
                let (text, mut calls) = parse_candidate(&parsed);
                if !text.is_empty() {
                    content.push_str(&text);
                    sink(&text);
                }
                tool_calls.append(&mut calls);
                if let Some(u) = parse_usage(&parsed) {
                    usage = Some(u);
                }
            }
        }

        Ok(CompletionResponse {
            content,
            tool_calls,
            usage,
            model: model.to_string(),
        })
    }

    fn validate_config(&self) -> Result<(), WeftError> {
        if self.api_key.is_empty() {
            return Err(WeftError::new(
                ErrorCode::ProviderInvalid,
                format!("provider {:?} requires an api key", self.name),
            )
            .with_context("provider", &self.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolDefinition;
    use serde_json::json;

    #[test]
    fn body_maps_roles_and_system_instruction() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi"), Message::assistant("hello")],
            system_prompt: Some("be kind".into()),
            tools: vec![ToolDefinition::new("search", "", json!({"type": "object"}))],
            ..Default::default()
        };
        let body = build_body(&request);
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "be kind");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(
            body["tools"][0]["functionDeclarations"][0]["name"],
            "search"
        );
    }

    #[test]
    fn tool_results_become_function_response_parts() {
        let request = CompletionRequest {
            messages: vec![Message::tool_result("call_1", "search", "found")],
            ..Default::default()
        };
        let body = build_body(&request);
        let part = &body["contents"][0]["parts"][0]["functionResponse"];
        assert_eq!(part["name"], "search");
        assert_eq!(part["response"]["content"], "found");
    }

    #[test]
    fn parses_function_call_with_synthesized_id() {
        let body = json!({
            "candidates": [{"content": {"parts": [
                {"text": "Checking."},
                {"functionCall": {"name": "search", "args": {"q": "hi"}}}
            ]}}],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3, "totalTokenCount": 10}
        });
        let (content, calls) = parse_candidate(&body);
        assert_eq!(content, "Checking.");
        assert_eq!(calls.len(), 1);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].arguments_value().unwrap(), json!({"q": "hi"}));
        assert_eq!(parse_usage(&body).unwrap().total_tokens, 10);
    }
}
