//! Anthropic native dialect: `POST {base}/v1/messages`.
//!
//! Tool calls live in `tool_use` content blocks and tool results travel back
//! as `tool_result` blocks inside a user message. Streaming is SSE with
//! interleaved `input_json_delta` fragments keyed by block index; the
//! [`ToolCallReassembler`](super::reassembler::ToolCallReassembler) puts them
//! back together.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::reassembler::ToolCallReassembler;
use super::sse::SseParser;
use super::{
    classify_status_error, classify_transport_error, ChunkSink, CompletionRequest,
    CompletionResponse, LlmProvider, Usage, DEFAULT_PROVIDER_TIMEOUT,
};
use crate::error::{ErrorCode, WeftError};
use crate::message::{Message, Role, ToolCall};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
/// The messages API requires max_tokens; this is the fallback when a request
/// does not set one.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    name: String,
    api_key: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
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
                .unwrap_or_else(|| "claude-sonnet-4-0".to_string()),
            client,
        })
    }

    async fn post_messages(&self, body: &Value) -> Result<reqwest::Response, WeftError> {
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;
        Ok(response)
    }
}

/// Builds the messages-API body.
pub(crate) fn build_body(model: &str, request: &CompletionRequest, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": wire_messages(&request.messages),
    });
    if let Some(system) = &request.system_prompt {
        body["system"] = json!(system);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.function.name,
                    "description": tool.function.description,
                    "input_schema": tool.function.parameters,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    if stream {
        body["stream"] = json!(true);
    }
    body
}

/// Converts the unified conversation to Anthropic content blocks. Tool
/// results become `tool_result` blocks inside a user message; consecutive
/// tool results collapse into one user turn.
fn wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
    for message in messages {
        match message.role {
            Role::System => {
                // System prompts ride in the top-level `system` field; a
                // stray system message degrades to a user turn.
                wire.push(json!({ "role": "user", "content": message.content_str() }));
            }
            Role::User => {
                wire.push(json!({ "role": "user", "content": message.content_str() }));
            }
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                if let Some(content) = &message.content {
                    if !content.is_empty() {
                        blocks.push(json!({ "type": "text", "text": content }));
                    }
                }
                for call in &message.tool_calls {
                    let input = call.arguments_value().unwrap_or_else(|_| json!({}));
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": call.id,
                        "name": call.function.name,
                        "input": input,
                    }));
                }
                wire.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.tool_call_id,
                    "content": message.content_str(),
                });
                // Merge into a preceding user turn made of tool results.
                if let Some(last) = wire.last_mut() {
                    if last["role"] == "user" {
                        if let Some(blocks) = last["content"].as_array_mut() {
                            blocks.push(block);
                            continue;
                        }
                    }
                }
                wire.push(json!({ "role": "user", "content": [block] }));
            }
        }
    }
    wire
}

/// Reduces a non-streaming messages response to the normalized shape.
pub(crate) fn parse_response(body: &Value) -> Result<CompletionResponse, WeftError> {
    let blocks = body
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| WeftError::new(ErrorCode::ProviderApiError, "response has no content"))?;

    let mut content = String::new();
    let mut tool_calls = Vec::new();
    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                content.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
            }
            Some("tool_use") => {
                let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
                tool_calls.push(ToolCall::new(id, name, input.to_string()));
            }
            _ => {}
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

fn parse_usage(usage: Option<&Value>) -> Option<Usage> {
    let usage = usage?;
    let prompt = usage.get("input_tokens").and_then(Value::as_u64)? as u32;
    let completion = usage
        .get("output_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}

/// Drives the SSE event stream: text deltas go to the sink, tool-use blocks
/// feed the reassembler, `message_delta`/`message_stop` finalize.
pub(crate) struct StreamState {
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    reassembler: ToolCallReassembler,
    pub stop_reason: Option<String>,
}

impl StreamState {
    pub fn new() -> Self {
        Self {
            content: String::new(),
            usage: None,
            model: String::new(),
            reassembler: ToolCallReassembler::new(),
            stop_reason: None,
        }
    }

    /// Applies one parsed event payload; returns a text delta for the sink.
    pub fn apply(&mut self, payload: &Value) -> Option<String> {
        match payload.get("type").and_then(Value::as_str) {
            Some("message_start") => {
                if let Some(model) = payload.pointer("/message/model").and_then(Value::as_str) {
                    self.model = model.to_string();
                }
                if let Some(usage) = parse_usage(payload.pointer("/message/usage")) {
                    self.usage = Some(usage);
                }
                None
            }
            Some("content_block_start") => {
                let index = payload.get("index").and_then(Value::as_i64).unwrap_or(0);
                let block = payload.get("content_block")?;
                if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                    let id = block.get("id").and_then(Value::as_str).unwrap_or_default();
                    let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
                    self.reassembler.block_start(index, id, name);
                }
                None
            }
            Some("content_block_delta") => {
                let index = payload.get("index").and_then(Value::as_i64).unwrap_or(0);
                let delta = payload.get("delta")?;
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str)?;
                        self.content.push_str(text);
                        Some(text.to_string())
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(Value::as_str)
                            .unwrap_or("");
                        self.reassembler.input_json_delta(index, partial);
                        None
                    }
                    _ => None,
                }
            }
            Some("content_block_stop") => {
                let index = payload.get("index").and_then(Value::as_i64).unwrap_or(0);
                self.reassembler.block_stop(index);
                None
            }
            Some("message_delta") => {
                if let Some(reason) = payload
                    .pointer("/delta/stop_reason")
                    .and_then(Value::as_str)
                {
                    self.stop_reason = Some(reason.to_string());
                    if reason == "tool_use" {
                        self.reassembler.finalize_all();
                    }
                }
                if let Some(output) = payload
                    .pointer("/usage/output_tokens")
                    .and_then(Value::as_u64)
                {
                    let mut usage = self.usage.unwrap_or_default();
                    usage.completion_tokens = output as u32;
                    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
                    self.usage = Some(usage);
                }
                None
            }
            Some("message_stop") => {
                self.reassembler.finalize_all();
                None
            }
            _ => None,
        }
    }

    pub fn finish(self) -> CompletionResponse {
        CompletionResponse {
            content: self.content,
            tool_calls: self.reassembler.into_tool_calls(),
            usage: self.usage,
            model: self.model,
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
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
        let body = build_body(model, request, false);
        let response = self.post_messages(&body).await?;

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
        let model = request.model.as_deref().unwrap_or(&self.model);
        let body = build_body(model, request, true);
        let response = self.post_messages(&body).await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status_error(&self.name, status.as_u16(), &text));
        }

        let mut parser = SseParser::new();
        let mut state = StreamState::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| classify_transport_error(&self.name, e))?;
            for event in parser.feed(&bytes) {
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(payload) => {
                        if let Some(text) = state.apply(&payload) {
                            sink(&text);
                        }
                    }
                    Err(_) => debug!(provider = %self.name, "skipping non-JSON SSE event"),
                }
            }
        }
        let mut response = state.finish();
        if response.model.is_empty() {
            response.model = model.to_string();
        }
        Ok(response)
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
    fn body_puts_system_and_tools_at_top_level() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            system_prompt: Some("be terse".into()),
            tools: vec![ToolDefinition::new(
                "read",
                "read a file",
                json!({"type": "object"}),
            )],
            ..Default::default()
        };
        let body = build_body("claude-sonnet-4-0", &request, false);
        assert_eq!(body["system"], "be terse");
        assert_eq!(body["tools"][0]["name"], "read");
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
    }

    #[test]
    fn tool_results_fold_into_one_user_turn() {
        let messages = vec![
            Message::assistant_tool_calls(
                None,
                vec![
                    ToolCall::new("toolu_1", "a", "{}"),
                    ToolCall::new("toolu_2", "b", "{}"),
                ],
            ),
            Message::tool_result("toolu_1", "a", "one"),
            Message::tool_result("toolu_2", "b", "two"),
        ];
        let wire = wire_messages(&messages);
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0]["content"][0]["type"], "tool_use");
        assert_eq!(wire[1]["role"], "user");
        assert_eq!(wire[1]["content"].as_array().unwrap().len(), 2);
        assert_eq!(wire[1]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn parses_mixed_content_response() {
        let body = json!({
            "model": "claude-sonnet-4-0",
            "content": [
                {"type": "text", "text": "Let me look."},
                {"type": "tool_use", "id": "toolu_X", "name": "search", "input": {"q": "hi"}}
            ],
            "usage": {"input_tokens": 12, "output_tokens": 8}
        });
        let response = parse_response(&body).unwrap();
        assert_eq!(response.content, "Let me look.");
        assert_eq!(response.tool_calls[0].id, "toolu_X");
        assert_eq!(
            response.tool_calls[0].arguments_value().unwrap(),
            json!({"q": "hi"})
        );
        assert_eq!(response.usage.unwrap().total_tokens, 20);
    }

    /// The recorded-transcript scenario: two tool_use blocks whose JSON
    /// fragments interleave across block indexes.
    #[test]
    fn stream_reassembles_interleaved_tool_calls() {
        let events = [
            json!({"type": "message_start", "message": {"model": "claude-sonnet-4-0", "usage": {"input_tokens": 9}}}),
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_A", "name": "search"}}),
            json!({"type": "content_block_start", "index": 1,
                   "content_block": {"type": "tool_use", "id": "toolu_B", "name": "read"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"q\":\"h"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"p"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "i\"}"}}),
            json!({"type": "content_block_delta", "index": 1,
                   "delta": {"type": "input_json_delta", "partial_json": "ath\":\"/x\"}"}}),
            json!({"type": "message_stop"}),
        ];
        let mut state = StreamState::new();
        for event in &events {
            state.apply(event);
        }
        let response = state.finish();
        assert_eq!(response.tool_calls.len(), 2);
        assert_eq!(response.tool_calls[0].id, "toolu_A");
        assert_eq!(response.tool_calls[0].function.name, "search");
        assert_eq!(
            response.tool_calls[0].arguments_value().unwrap(),
            json!({"q": "hi"})
        );
        assert_eq!(response.tool_calls[1].id, "toolu_B");
        assert_eq!(response.tool_calls[1].function.name, "read");
        assert_eq!(
            response.tool_calls[1].arguments_value().unwrap(),
            json!({"path": "/x"})
        );
    }

    #[test]
    fn stream_text_deltas_reach_the_sink_in_order() {
        let events = [
            json!({"type": "content_block_start", "index": 0, "content_block": {"type": "text"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "hel"}}),
            json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "lo"}}),
            json!({"type": "content_block_stop", "index": 0}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
            json!({"type": "message_stop"}),
        ];
        let mut state = StreamState::new();
        let mut chunks = Vec::new();
        for event in &events {
            if let Some(text) = state.apply(event) {
                chunks.push(text);
            }
        }
        assert_eq!(chunks, vec!["hel", "lo"]);
        let response = state.finish();
        assert_eq!(response.content, "hello");
        assert!(response.tool_calls.is_empty());
    }

    #[test]
    fn stop_reason_tool_use_finalizes_pending_blocks() {
        let events = [
            json!({"type": "content_block_start", "index": 0,
                   "content_block": {"type": "tool_use", "id": "toolu_P", "name": "list"}}),
            json!({"type": "content_block_delta", "index": 0,
                   "delta": {"type": "input_json_delta", "partial_json": "{\"path\":\"/tmp\""}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 4}}),
        ];
        let mut state = StreamState::new();
        for event in &events {
            state.apply(event);
        }
        let response = state.finish();
        // Truncated JSON was repaired at finalize.
        assert_eq!(
            response.tool_calls[0].arguments_value().unwrap(),
            json!({"path": "/tmp"})
        );
    }
}
