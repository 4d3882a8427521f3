//! # Weft
//!
//! A multi-protocol bridge and orchestration runtime between LLM providers
//! and MCP tool servers. Weft keeps long-lived stdio connections to MCP
//! subprocesses, multiplexes JSON-RPC traffic over them, fronts four provider
//! wire dialects with one completion/streaming contract, executes declarative
//! workflow DAGs, and re-exposes the composed capabilities downstream.
//!
//! ## Main modules
//!
//! - [`jsonrpc`]: the JSON-RPC 2.0 envelope ([`JsonRpcMessage`]).
//! - [`transport`]: stdio subprocess transport ([`StdioTransport`]) with the
//!   20 MB line cap and the stderr classifier
//!   ([`transport::stderr::is_real_error`]).
//! - [`dispatch`]: [`ResponseDispatcher`] — per-request response channels
//!   keyed by stringified id.
//! - [`mcp`]: `initialize` / `tools/list` / `tools/call` helpers
//!   ([`McpClient`], [`ServerConnection`]).
//! - [`provider`]: the [`LlmProvider`] contract and the OpenAI-compatible,
//!   Anthropic, Ollama, and Gemini dialects; SSE parsing, tool-call
//!   reassembly, JSON repair.
//! - [`workflow`]: [`WorkflowEngine`] — step DAG scheduling, substitution,
//!   conditions, `for_each`, `parallel`, consensus.
//! - [`agent`]: the bounded agentic loop and [`ToolRouter`] seam with
//!   `<server>_<tool>` namespacing.
//! - [`skill`]: SKILL.md discovery and validation.
//! - [`sandbox`]: containerized skill execution with the dual-mount policy.
//! - [`error`] / [`output`]: the typed [`WeftError`] taxonomy and the
//!   verbosity-gated stderr writer.
//!
//! Configuration schemas live in the sibling `config` crate; the serve
//! surfaces (stdio MCP server, HTTP proxy) in the `serve` crate.

pub mod agent;
pub mod dispatch;
pub mod error;
pub mod jsonrpc;
pub mod mcp;
pub mod message;
pub mod output;
pub mod provider;
pub mod sandbox;
pub mod skill;
pub mod transport;
pub mod workflow;

pub use agent::{
    namespaced_tool_name, run_agentic_loop, AgenticOutcome, AgenticRun, CompositeToolRouter,
    NoTools, ServerToolRouter, ToolRouter, DEFAULT_MAX_ITERATIONS,
};
pub use dispatch::ResponseDispatcher;
pub use error::{ErrorCode, WeftError};
pub use jsonrpc::{JsonRpcError, JsonRpcMessage};
pub use mcp::{connect_servers, CallToolResult, McpClient, ServerConnection, ToolInfo};
pub use message::{
    Conversation, FunctionCall, FunctionDefinition, Message, Role, ToolCall, ToolDefinition,
};
pub use output::{OutputWriter, Verbosity};
pub use provider::{
    build_provider, build_providers, AnthropicProvider, ChunkSink, CompletionRequest,
    CompletionResponse, EmbeddingsRequest, EmbeddingsResponse, GeminiProvider, LlmProvider,
    OllamaProvider, OpenAiCompatProvider, Usage,
};
pub use sandbox::{
    detect_executor, running_in_container, DockerApiExecutor, ExecOutput, ExecSpec, Mount,
    NativeCliExecutor, SandboxExecutor, SandboxPolicy, SkillSandbox,
};
pub use skill::{load_skill, parse_frontmatter, scan_skills, validate_skill_name, Skill};
pub use transport::{StdioTransport, TransportConfig, MAX_LINE_BYTES};
pub use workflow::{
    evaluate_condition, substitute, Agreement, ConsensusOutcome, StepRecord, StepStatus,
    SubstitutionEnv, WorkflowEngine, WorkflowOutcome,
};
