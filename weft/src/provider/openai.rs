//! OpenAI-compatible dialect.
//!
//! One client covers OpenAI itself plus the compatible surfaces (DeepSeek,
//! OpenRouter, LM Studio): `POST {base}/chat/completions` with bearer auth.
//! Streaming deltas key tool calls by array index; the accumulator collects
//! id/name/argument fragments per index and repairs the final JSON.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::repair::validate_or_repair;
use super::sse::SseParser;
use super::{
    classify_status_error, classify_transport_error, ChunkSink, CompletionRequest,
    CompletionResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider, Usage,
    DEFAULT_PROVIDER_TIMEOUT,
};
use crate::error::{ErrorCode, WeftError};
use crate::message::{Message, Role, ToolCall};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiCompatProvider {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
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
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            client,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request_model<'a>(&'a self, request: &'a CompletionRequest) -> &'a str {
        request.model.as_deref().unwrap_or(&self.model)
    }
}

/// Builds the chat-completions body shared by the streaming and
/// non-streaming paths.
pub(crate) fn build_body(model: &str, request: &CompletionRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        messages.push(wire_message(message));
    }

    let mut body = json!({ "model": model, "messages": messages });
    if !request.tools.is_empty() {
        body["tools"] = serde_json::to_value(&request.tools).unwrap_or(Value::Null);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(m) = request.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if stream {
        body["stream"] = json!(true);
        body["stream_options"] = json!({ "include_usage": true });
    }
    body
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => json!({
            "role": "assistant",
            "content": message.content,
            "tool_calls": message.tool_calls,
        }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": message.tool_call_id,
            "content": message.content_str(),
        }),
        _ => json!({
            "role": message.role,
            "content": message.content_str(),
        }),
    }
}

/// Reduces a non-streaming response body to the normalized shape.
pub(crate) fn parse_response(body: &Value) -> Result<CompletionResponse, WeftError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| WeftError::new(ErrorCode::ProviderApiError, "response has no choices"))?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut tool_calls = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            tool_calls.push(ToolCall::new(id, name, validate_or_repair(arguments)));
        }
    }

    Ok(CompletionResponse {
        content,
        tool_calls,
        usage: parse_usage(body.get("usage")),
        model: body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    })
}

pub(crate) fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    Some(Usage {
        prompt_tokens: usage.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    })
}

/// Accumulates streaming deltas: content text plus per-index tool-call
/// fragments.
#[derive(Debug, Default)]
pub(crate) struct StreamAccumulator {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    calls: BTreeMap<u64, PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl StreamAccumulator {
    /// Applies one `data:` chunk; returns any text delta for the sink.
    pub fn apply(&mut self, chunk: &Value) -> Option<String> {
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            self.model = model.to_string();
        }
        if let Some(usage) = parse_usage(chunk.get("usage")) {
            self.usage = Some(usage);
        }

        let delta = chunk.pointer("/choices/0/delta")?;
        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let partial = self.calls.entry(index).or_default();
                if let Some(id) = call.get("id").and_then(Value::as_str) {
                    partial.id = id.to_string();
                }
                if let Some(name) = call.pointer("/function/name").and_then(Value::as_str) {
                    partial.name = name.to_string();
                }
                if let Some(arguments) = call
                    .pointer("/function/arguments")
                    .and_then(Value::as_str)
                {
                    partial.arguments.push_str(arguments);
                }
            }
        }

        let text = delta.get("content").and_then(Value::as_str)?;
        if text.is_empty() {
            return None;
        }
        self.content.push_str(text);
        Some(text.to_string())
    }

    pub fn finish(self) -> CompletionResponse {
        let tool_calls = self
            .calls
            .into_values()
            .map(|partial| {
                ToolCall::new(
                    partial.id,
                    partial.name,
                    validate_or_repair(&partial.arguments),
                )
            })
            .collect();
        CompletionResponse {
            content: self.content,
            tool_calls,
            usage: self.usage,
            model: self.model,
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
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
        let model = self.request_model(request);
        let body = build_body(model, request, false);
        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
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
        parse_response(&parsed)
    }

    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResponse, WeftError> {
        let model = self.request_model(request);
        let body = build_body(model, request, true);
        let response = self
            .client
            .post(self.endpoint("/chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status_error(&self.name, status.as_u16(), &text));
        }

        let mut parser = SseParser::new();
        let mut acc = StreamAccumulator::default();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| classify_transport_error(&self.name, e))?;
            for event in parser.feed(&bytes) {
                if event.data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(value) => {
                        if let Some(text) = acc.apply(&value) {
                            sink(&text);
                        }
                    }
                    Err(_) => debug!(provider = %self.name, "skipping non-JSON SSE chunk"),
                }
            }
        }
        let mut response = acc.finish();
        if response.model.is_empty() {
            response.model = model.to_string();
        }
        Ok(response)
    }

    async fn create_embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, WeftError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let response = self
            .client
            .post(self.endpoint("/embeddings"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": model, "input": request.input }))
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
            WeftError::new(ErrorCode::ProviderApiError, "unparseable embeddings response")
                .with_cause(e)
        })?;
        let embeddings = parsed
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        row.get("embedding").and_then(Value::as_array).map(|v| {
                            v.iter()
                                .filter_map(Value::as_f64)
                                .map(|f| f as f32)
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(EmbeddingsResponse {
            embeddings,
            model: model.to_string(),
            usage: parse_usage(parsed.get("usage")),
        })
    }

    fn validate_config(&self) -> Result<(), WeftError> {
        if self.base_url.is_empty() {
            return Err(WeftError::new(
                ErrorCode::ProviderInvalid,
                "base_url must not be empty",
            ));
        }
        // Local OpenAI-compatible servers (LM Studio) run keyless, so an
        // empty key is only rejected for the hosted default endpoint.
        if self.api_key.is_empty() && self.base_url == DEFAULT_BASE_URL {
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

    fn request_with_tool() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("find x")],
            tools: vec![ToolDefinition::new(
                "search",
                "find things",
                json!({"type": "object", "properties": {"q": {"type": "string"}}}),
            )],
            system_prompt: Some("be brief".into()),
            temperature: Some(0.2),
            ..Default::default()
        }
    }

    #[test]
    fn body_includes_system_tools_and_temperature() {
        let body = build_body("gpt-4o", &request_with_tool(), false);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["tools"][0]["function"]["name"], "search");
        assert_eq!(body["temperature"], json!(0.2));
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn tool_result_messages_carry_call_id() {
        let request = CompletionRequest {
            messages: vec![
                Message::assistant_tool_calls(
                    None,
                    vec![ToolCall::new("call_1", "search", r#"{"q":"x"}"#)],
                ),
                Message::tool_result("call_1", "search", "found it"),
            ],
            ..Default::default()
        };
        let body = build_body("m", &request, false);
        assert_eq!(body["messages"][0]["tool_calls"][0]["id"], "call_1");
        assert_eq!(body["messages"][1]["role"], "tool");
        assert_eq!(body["messages"][1]["tool_call_id"], "call_1");
        assert_eq!(body["messages"][1]["content"], "found it");
    }

    #[test]
    fn parses_tool_call_response() {
        let body = json!({
            "model": "gpt-4o",
            "choices": [{"message": {
                "content": null,
                "tool_calls": [{"id": "call_9", "type": "function",
                    "function": {"name": "search", "arguments": "{\"q\":\"hi\"}"}}]
            }}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let response = parse_response(&body).unwrap();
        assert!(response.content.is_empty());
        assert_eq!(response.tool_calls[0].id, "call_9");
        assert_eq!(response.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn round_trip_preserves_tool_calls() {
        // toProvider then fromProvider: id, name, and parsed arguments survive.
        let original = ToolCall::new("call_rt", "read", r#"{"path":"/x"}"#);
        let request = CompletionRequest {
            messages: vec![Message::assistant_tool_calls(None, vec![original.clone()])],
            ..Default::default()
        };
        let body = build_body("m", &request, false);
        let echoed = json!({
            "model": "m",
            "choices": [{"message": {
                "content": null,
                "tool_calls": body["messages"][0]["tool_calls"].clone()
            }}]
        });
        let response = parse_response(&echoed).unwrap();
        assert_eq!(response.tool_calls[0].id, original.id);
        assert_eq!(response.tool_calls[0].function.name, original.function.name);
        assert_eq!(
            response.tool_calls[0].arguments_value().unwrap(),
            original.arguments_value().unwrap()
        );
    }

    #[test]
    fn stream_accumulator_collects_text_and_tool_fragments() {
        let mut acc = StreamAccumulator::default();
        assert_eq!(
            acc.apply(&json!({"choices": [{"delta": {"content": "hel"}}]})),
            Some("hel".to_string())
        );
        assert_eq!(
            acc.apply(&json!({"choices": [{"delta": {"content": "lo"}}]})),
            Some("lo".to_string())
        );
        acc.apply(&json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "id": "call_s", "function": {"name": "search", "arguments": "{\"q\":"}}
        ]}}]}));
        acc.apply(&json!({"choices": [{"delta": {"tool_calls": [
            {"index": 0, "function": {"arguments": "\"hi\"}"}}
        ]}}]}));
        acc.apply(&json!({"usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}}));

        let response = acc.finish();
        assert_eq!(response.content, "hello");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_s");
        assert_eq!(
            response.tool_calls[0].arguments_value().unwrap(),
            json!({"q": "hi"})
        );
        assert_eq!(response.usage.unwrap().total_tokens, 5);
    }

    #[test]
    fn keyless_local_endpoint_validates() {
        let settings = config::ProviderSettings {
            base_url: Some("http://localhost:1234/v1".into()),
            default_model: Some("local-model".into()),
            ..Default::default()
        };
        let provider = OpenAiCompatProvider::new("lmstudio", &settings).unwrap();
        assert!(provider.validate_config().is_ok());
    }
}
