//! LLM provider abstraction.
//!
//! One polymorphic [`LlmProvider`] trait fronts four wire dialects:
//! OpenAI-compatible (shared by OpenAI, DeepSeek, OpenRouter, LM Studio),
//! Anthropic native, Ollama native, and Gemini native. Every dialect reduces
//! its response to the same [`ToolCall`] shape before returning, so nothing
//! above this layer knows which provider answered.

pub mod anthropic;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod reassembler;
pub mod repair;
pub mod sse;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, WeftError};
use crate::message::{Message, ToolCall, ToolDefinition};

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiCompatProvider;

/// Default wall-clock bound for one provider HTTP call.
pub const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

/// A completion request, provider-agnostic.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub system_prompt: Option<String>,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A completion response, normalized across dialects.
#[derive(Debug, Clone, Default)]
pub struct CompletionResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<Usage>,
    pub model: String,
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Embeddings passthrough request.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingsRequest {
    pub input: Vec<String>,
    pub model: Option<String>,
}

/// Embeddings passthrough response.
#[derive(Debug, Clone, Default)]
pub struct EmbeddingsResponse {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub usage: Option<Usage>,
}

/// Callback receiving text chunks in wire order during streaming. Tool-call
/// arguments are never streamed through it; they arrive as a single final
/// value on the response once reassembly completes.
pub type ChunkSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// The provider contract.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Configured provider name (the key in the providers map).
    fn name(&self) -> &str;

    /// Default model used when a request does not override it.
    fn default_model(&self) -> &str;

    async fn create_completion(
        &self,
        request: &CompletionRequest,
    ) -> Result<CompletionResponse, WeftError>;

    /// Streaming variant. Text chunks go to `sink` as they arrive; the full
    /// response (content + reassembled tool calls) is still returned at the
    /// end. The default forwards the non-streaming result as one chunk.
    async fn stream_completion(
        &self,
        request: &CompletionRequest,
        sink: ChunkSink<'_>,
    ) -> Result<CompletionResponse, WeftError> {
        let response = self.create_completion(request).await?;
        if !response.content.is_empty() {
            sink(&response.content);
        }
        Ok(response)
    }

    /// Embeddings; dialects without an embeddings surface return
    /// `PROVIDER_INVALID`.
    async fn create_embeddings(
        &self,
        _request: &EmbeddingsRequest,
    ) -> Result<EmbeddingsResponse, WeftError> {
        Err(WeftError::new(
            ErrorCode::ProviderInvalid,
            format!("provider {:?} does not support embeddings", self.name()),
        ))
    }

    /// Cheap static validation (key present, base URL sane).
    fn validate_config(&self) -> Result<(), WeftError>;
}

/// Builds one provider from its settings.
///
/// The wire dialect is configuration-driven: an explicit `interface` tag
/// always wins; otherwise the provider name selects a sensible default
/// (a provider literally named "anthropic" speaks Anthropic, and so on),
/// falling back to OpenAI-compatible.
pub fn build_provider(
    name: &str,
    settings: &config::ProviderSettings,
) -> Result<Arc<dyn LlmProvider>, WeftError> {
    let interface = settings
        .interface
        .unwrap_or_else(|| default_interface_for(name));
    let provider: Arc<dyn LlmProvider> = match interface {
        config::ProviderInterface::OpenaiCompat => {
            Arc::new(OpenAiCompatProvider::new(name, settings)?)
        }
        config::ProviderInterface::Anthropic => Arc::new(AnthropicProvider::new(name, settings)?),
        config::ProviderInterface::Ollama => Arc::new(OllamaProvider::new(name, settings)?),
        config::ProviderInterface::Gemini => Arc::new(GeminiProvider::new(name, settings)?),
    };
    provider.validate_config()?;
    Ok(provider)
}

/// Builds every configured provider; unknown or misconfigured entries fail
/// the whole map so problems surface at startup, not mid-workflow.
pub fn build_providers(
    app: &config::ApplicationConfig,
) -> Result<HashMap<String, Arc<dyn LlmProvider>>, WeftError> {
    let mut providers = HashMap::new();
    for (name, settings) in &app.providers {
        let provider = build_provider(name, settings)
            .map_err(|e| e.with_context("provider", name.clone()))?;
        providers.insert(name.clone(), provider);
    }
    Ok(providers)
}

fn default_interface_for(name: &str) -> config::ProviderInterface {
    match name.to_ascii_lowercase().as_str() {
        "anthropic" | "claude" => config::ProviderInterface::Anthropic,
        "ollama" => config::ProviderInterface::Ollama,
        "gemini" | "google" => config::ProviderInterface::Gemini,
        _ => config::ProviderInterface::OpenaiCompat,
    }
}

/// Maps an HTTP failure to the provider error taxonomy: timeouts are
/// `PROVIDER_TIMEOUT`, everything else `PROVIDER_API_ERROR` (both retryable).
pub(crate) fn classify_transport_error(provider: &str, err: reqwest::Error) -> WeftError {
    let code = if err.is_timeout() {
        ErrorCode::ProviderTimeout
    } else {
        ErrorCode::ProviderApiError
    };
    WeftError::new(code, format!("request to {provider} failed: {err}"))
        .with_cause(err)
        .with_context("provider", provider)
}

/// Maps a non-success HTTP status to the taxonomy.
pub(crate) fn classify_status_error(provider: &str, status: u16, body: &str) -> WeftError {
    let code = if status == 408 {
        ErrorCode::ProviderTimeout
    } else {
        ErrorCode::ProviderApiError
    };
    let snippet: String = body.chars().take(400).collect();
    WeftError::new(code, format!("{provider} returned HTTP {status}: {snippet}"))
        .with_context("provider", provider)
        .with_context("status", status.to_string())
}

#[cfg(test)]
pub(crate) mod mock {
    //! Mock provider backing the workflow-engine and agentic-loop tests.

    use std::sync::Mutex;

    use super::*;

    /// Scripted provider: pops one outcome per call.
    pub struct MockProvider {
        name: String,
        outcomes: Mutex<Vec<Result<CompletionResponse, WeftError>>>,
        pub calls: Mutex<Vec<CompletionRequest>>,
    }

    impl MockProvider {
        pub fn new(
            name: &str,
            outcomes: Vec<Result<CompletionResponse, WeftError>>,
        ) -> Self {
            Self {
                name: name.to_string(),
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn text(name: &str, content: &str) -> Self {
            Self::new(
                name,
                vec![Ok(CompletionResponse {
                    content: content.to_string(),
                    model: "mock".to_string(),
                    ..Default::default()
                })],
            )
        }

        pub fn failing(name: &str, code: ErrorCode) -> Self {
            Self::new(name, vec![Err(WeftError::new(code, "mock failure"))])
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        fn default_model(&self) -> &str {
            "mock"
        }

        async fn create_completion(
            &self,
            request: &CompletionRequest,
        ) -> Result<CompletionResponse, WeftError> {
            self.calls.lock().unwrap().push(request.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                return Ok(CompletionResponse {
                    content: "exhausted".to_string(),
                    model: "mock".to_string(),
                    ..Default::default()
                });
            }
            outcomes.remove(0)
        }

        fn validate_config(&self) -> Result<(), WeftError> {
            Ok(())
        }
    }
}
