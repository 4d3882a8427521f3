//! Ollama native dialect: `POST {base}/api/chat`.
//!
//! Ollama returns tool-call arguments as a JSON object (not a string) and
//! assigns no call ids, so ids are synthesized with the `tc_` prefix.
//! Streaming is newline-delimited JSON rather than SSE.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{
    classify_status_error, classify_transport_error, ChunkSink, CompletionRequest,
    CompletionResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider, Usage,
    DEFAULT_PROVIDER_TIMEOUT,
};
use crate::error::{ErrorCode, WeftError};
use crate::message::{Message, Role, ToolCall};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    name: String,
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaProvider {
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
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: settings
                .default_model
                .clone()
                .unwrap_or_else(|| "llama3.2".to_string()),
            client,
        })
    }
}

pub(crate) fn build_body(model: &str, request: &CompletionRequest, stream: bool) -> Value {
    let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for message in &request.messages {
        messages.push(wire_message(message));
    }

    let mut body = json!({ "model": model, "messages": messages, "stream": stream });
    if !request.tools.is_empty() {
        body["tools"] = serde_json::to_value(&request.tools).unwrap_or(Value::Null);
    }
    if let Some(t) = request.temperature {
        body["options"] = json!({ "temperature": t });
    }
    body
}

fn wire_message(message: &Message) -> Value {
    match message.role {
        Role::Assistant if !message.tool_calls.is_empty() => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "function": {
                            "name": call.function.name,
                            "arguments": call.arguments_value().unwrap_or_else(|_| json!({})),
                        }
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": message.content_str(),
                "tool_calls": calls,
            })
        }
        Role::Tool => json!({ "role": "tool", "content": message.content_str() }),
        _ => json!({ "role": message.role, "content": message.content_str() }),
    }
}

/// Extracts tool calls from one response message, synthesizing `tc_*` ids.
pub(crate) fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
    let Some(calls) = message.get("tool_calls").and_then(Value::as_array) else {
        return Vec::new();
    };
    calls
        .iter()
        .enumerate()
        .map(|(n, call)| {
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = call
                .pointer("/function/arguments")
                .cloned()
                .unwrap_or_else(|| json!({}));
            ToolCall::new(format!("tc_{n}"), name, arguments.to_string())
        })
        .collect()
}

pub(crate) fn parse_usage(body: &Value) -> Option<Usage> {
    let prompt = body.get("prompt_eval_count").and_then(Value::as_u64)? as u32;
    let completion = body.get("eval_count").and_then(Value::as_u64).unwrap_or(0) as u32;
    Some(Usage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: prompt + completion,
    })
}

#[async_trait]
impl LlmProvider for OllamaProvider {
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
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
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

        let message = parsed.get("message").cloned().unwrap_or_default();
        Ok(CompletionResponse {
            content: message
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            tool_calls: parse_tool_calls(&message),
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
        let body = build_body(model, request, true);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status_error(&self.name, status.as_u16(), &text));
        }

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        let mut usage = None;
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| classify_transport_error(&self.name, e))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(parsed) = serde_json::from_str::<Value>(line) else {
                    debug!(provider = %self.name, "skipping non-JSON stream line");
                    continue;
                };
                if let Some(message) = parsed.get("message") {
                    if let Some(text) = message.get("content").and_then(Value::as_str) {
                        if !text.is_empty() {
                            content.push_str(text);
                            sink(text);
                        }
                    }
                    let mut calls = parse_tool_calls(message);
                    if !calls.is_empty() {
                        // Re-number ids across the whole stream.
                        for call in &mut calls {
                            call.id = format!("tc_{}", tool_calls.len());
                            tool_calls.push(call.clone());
                        }
                    }
                }
                if parsed.get("done").and_then(Value::as_bool) == Some(true) {
                    usage = parse_usage(&parsed);
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

    async fn create_embeddings(
        &self,
        request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, WeftError> {
        let model = request.model.as_deref().unwrap_or(&self.model);
        let response = self
            .client
            .post(format!("{}/api/embed", self.base_url))
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
            .get("embeddings")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| {
                        row.as_array().map(|v| {
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
            usage: None,
        })
    }

    fn validate_config(&self) -> Result<(), WeftError> {
        if self.base_url.is_empty() {
            return Err(WeftError::new(
                ErrorCode::ProviderInvalid,
                "base_url must not be empty",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_carries_options_temperature() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            temperature: Some(0.7),
            ..Default::default()
        };
        let body = build_body("llama3.2", &request, false);
        assert_eq!(body["options"]["temperature"], json!(0.7));
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn assistant_tool_calls_become_object_arguments() {
        let request = CompletionRequest {
            messages: vec![Message::assistant_tool_calls(
                None,
                vec![ToolCall::new("tc_0", "search", r#"{"q":"x"}"#)],
            )],
            ..Default::default()
        };
        let body = build_body("m", &request, false);
        // Arguments travel as an object, not a string.
        assert_eq!(
            body["messages"][0]["tool_calls"][0]["function"]["arguments"],
            json!({"q": "x"})
        );
    }

    #[test]
    fn parses_tool_calls_with_synthesized_ids() {
        let message = json!({
            "content": "",
            "tool_calls": [
                {"function": {"name": "search", "arguments": {"q": "hi"}}},
                {"function": {"name": "read", "arguments": {"path": "/x"}}}
            ]
        });
        let calls = parse_tool_calls(&message);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].id, "tc_0");
        assert_eq!(calls[1].id, "tc_1");
        assert_eq!(calls[1].arguments_value().unwrap(), json!({"path": "/x"}));
    }

    #[test]
    fn usage_comes_from_eval_counts() {
        let body = json!({"prompt_eval_count": 11, "eval_count": 4});
        let usage = parse_usage(&body).unwrap();
        assert_eq!(usage.prompt_tokens, 11);
        assert_eq!(usage.total_tokens, 15);
    }
}
