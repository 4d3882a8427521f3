//! Agentic loop and tool routing.
//!
//! When a completion returns tool calls, the loop executes them and feeds the
//! results back as tool messages, re-invoking the model until it answers in
//! text or the iteration bound trips. Tool names are namespaced
//! `<server>_<tool>` (hyphens in the server portion normalized to
//! underscores); the [`ToolRouter`] seam lets skills route in-process while
//! MCP tools route to subprocess connections.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ErrorCode, WeftError};
use crate::mcp::{ServerConnection, ToolInfo};
use crate::message::{Message, ToolDefinition};
use crate::output::OutputWriter;
use crate::provider::{repair::validate_or_repair, CompletionRequest, LlmProvider, Usage};

/// Default agentic iteration bound.
pub const DEFAULT_MAX_ITERATIONS: u32 = 10;

/// Routes namespaced tool calls to whatever executes them.
#[async_trait]
pub trait ToolRouter: Send + Sync {
    /// Tools offered to the model, already namespaced.
    fn tool_definitions(&self) -> Vec<ToolDefinition>;

    /// Executes one tool by its namespaced name.
    async fn call(&self, name: &str, arguments: &Value) -> Result<String, WeftError>;
}

/// Namespaces a tool as `<server>_<tool>`, normalizing hyphens to
/// underscores in the server portion only.
pub fn namespaced_tool_name(server: &str, tool: &str) -> String {
    format!("{}_{tool}", server.replace('-', "_"))
}

/// Router over a set of MCP server connections.
pub struct ServerToolRouter {
    servers: Vec<ServerEntry>,
}

struct ServerEntry {
    connection: Arc<ServerConnection>,
    tools: Vec<ToolInfo>,
}

impl ServerToolRouter {
    /// Lists tools on every connection and builds the namespaced catalog.
    pub async fn discover(connections: Vec<Arc<ServerConnection>>) -> Result<Self, WeftError> {
        let mut servers = Vec::with_capacity(connections.len());
        for connection in connections {
            let tools = connection.client().list_tools().await?;
            debug!(server = %connection.name(), count = tools.len(), "discovered tools");
            servers.push(ServerEntry { connection, tools });
        }
        Ok(Self { servers })
    }

    /// Resolves a namespaced name to `(server index, bare tool name)`.
    ///
    /// Both the original and the underscore-normalized server prefix are
    /// accepted, and the bare name must actually exist in that server's
    /// catalog, so a server named `a` with tool `b_c` never shadows a server
    /// named `a_b` with tool `c`.
    fn resolve<'n>(&self, name: &'n str) -> Option<(usize, &'n str)> {
        for (idx, entry) in self.servers.iter().enumerate() {
            let server = entry.connection.name();
            for prefix in [server.replace('-', "_"), server.to_string()] {
                if let Some(bare) = name
                    .strip_prefix(prefix.as_str())
                    .and_then(|rest| rest.strip_prefix('_'))
                {
                    if entry.tools.iter().any(|t| t.name == bare) {
                        return Some((idx, bare));
                    }
                }
            }
        }
        None
    }
}

#[async_trait]
impl ToolRouter for ServerToolRouter {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.servers
            .iter()
            .flat_map(|entry| {
                let server = entry.connection.name();
                entry.tools.iter().map(move |tool| {
                    ToolDefinition::new(
                        namespaced_tool_name(server, &tool.name),
                        tool.description.clone(),
                        tool.input_schema.clone(),
                    )
                })
            })
            .collect()
    }

    async fn call(&self, name: &str, arguments: &Value) -> Result<String, WeftError> {
        let Some((idx, bare)) = self.resolve(name) else {
            return Err(WeftError::new(
                ErrorCode::ToolNotFound,
                format!("no server exposes tool {name:?}"),
            ));
        };
        let entry = &self.servers[idx];
        entry
            .connection
            .client()
            .call_tool(bare, arguments.clone())
            .await
    }
}

/// Router that concatenates several routers; the first one advertising a
/// name wins.
pub struct CompositeToolRouter {
    routers: Vec<Arc<dyn ToolRouter>>,
}

impl CompositeToolRouter {
    pub fn new(routers: Vec<Arc<dyn ToolRouter>>) -> Self {
        Self { routers }
    }
}

#[async_trait]
impl ToolRouter for CompositeToolRouter {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.routers
            .iter()
            .flat_map(|r| r.tool_definitions())
            .collect()
    }

    async fn call(&self, name: &str, arguments: &Value) -> Result<String, WeftError> {
        for router in &self.routers {
            if router
                .tool_definitions()
                .iter()
                .any(|t| t.function.name == name)
            {
                return router.call(name, arguments).await;
            }
        }
        Err(WeftError::new(
            ErrorCode::ToolNotFound,
            format!("no router exposes tool {name:?}"),
        ))
    }
}

/// Empty router for steps that run without tools.
pub struct NoTools;

#[async_trait]
impl ToolRouter for NoTools {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn call(&self, name: &str, _arguments: &Value) -> Result<String, WeftError> {
        Err(WeftError::new(
            ErrorCode::ToolNotFound,
            format!("no tools are configured (requested {name:?})"),
        ))
    }
}

/// Result of one agentic run.
#[derive(Debug)]
pub struct AgenticOutcome {
    /// Final assistant text.
    pub content: String,
    /// Full conversation, including tool traffic.
    pub transcript: Vec<Message>,
    /// Completed LLM round trips.
    pub iterations: u32,
    pub usage: Option<Usage>,
}

/// Parameters for one agentic run.
pub struct AgenticRun<'a> {
    pub provider: &'a dyn LlmProvider,
    pub router: &'a dyn ToolRouter,
    pub system_prompt: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_iterations: u32,
    pub output: &'a OutputWriter,
}

/// Runs the bounded LLM ↔ tool loop starting from `messages`.
///
/// Provider errors are fatal to the run. Tool-execution failures are fed back
/// to the model as tool-result content so it can recover on the next turn.
/// Exceeding the bound is `TOOL_EXECUTION_ERROR` with the partial transcript
/// attached in context.
pub async fn run_agentic_loop(
    run: AgenticRun<'_>,
    mut messages: Vec<Message>,
) -> Result<AgenticOutcome, WeftError> {
    let tools = run.router.tool_definitions();
    let mut usage_total: Option<Usage> = None;

    for iteration in 1..=run.max_iterations {
        let request = CompletionRequest {
            messages: messages.clone(),
            tools: tools.clone(),
            system_prompt: run.system_prompt.clone(),
            model: run.model.clone(),
            temperature: run.temperature,
            max_tokens: None,
        };
        let response = run.provider.create_completion(&request).await?;
        accumulate_usage(&mut usage_total, response.usage);

        if response.tool_calls.is_empty() {
            messages.push(Message::assistant(response.content.clone()));
            return Ok(AgenticOutcome {
                content: response.content,
                transcript: messages,
                iterations: iteration,
                usage: usage_total,
            });
        }

        messages.push(Message::assistant_tool_calls(
            Some(response.content.clone()),
            response.tool_calls.clone(),
        ));

        for call in &response.tool_calls {
            let name = &call.function.name;
            let arguments: Value =
                serde_json::from_str(&validate_or_repair(&call.function.arguments))
                    .unwrap_or_else(|_| Value::Object(Default::default()));
            run.output.detail(&format!("tool call: {name} {arguments}"));

            let result = match run.router.call(name, &arguments).await {
                Ok(text) => text,
                Err(e) => {
                    // Feed the failure back; the model recovers next turn.
                    warn!(tool = %name, error = %e, "tool execution failed");
                    format!("Error: {e}")
                }
            };
            messages.push(Message::tool_result(&call.id, name, result));
        }
    }

    let transcript_json = serde_json::to_string(&messages).unwrap_or_default();
    Err(WeftError::new(
        ErrorCode::ToolExecutionError,
        format!(
            "agentic loop exceeded {} iterations without a final answer",
            run.max_iterations
        ),
    )
    .with_context("transcript", transcript_json))
}

fn accumulate_usage(total: &mut Option<Usage>, delta: Option<Usage>) {
    if let Some(delta) = delta {
        let t = total.get_or_insert(Usage::default());
        t.prompt_tokens += delta.prompt_tokens;
        t.completion_tokens += delta.completion_tokens;
        t.total_tokens += delta.total_tokens;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;
    use crate::output::Verbosity;
    use crate::provider::mock::MockProvider;
    use crate::provider::CompletionResponse;
    use std::sync::Mutex;

    fn quiet() -> OutputWriter {
        OutputWriter::with_sink(Verbosity::Quiet, Box::new(std::io::sink()))
    }

    struct ScriptedRouter {
        tools: Vec<ToolDefinition>,
        results: Mutex<Vec<Result<String, WeftError>>>,
        pub calls: Mutex<Vec<(String, Value)>>,
    }

    impl ScriptedRouter {
        fn new(tools: Vec<&str>, results: Vec<Result<String, WeftError>>) -> Self {
            Self {
                tools: tools
                    .into_iter()
                    .map(|name| {
                        ToolDefinition::new(name, "", serde_json::json!({"type": "object"}))
                    })
                    .collect(),
                results: Mutex::new(results),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ToolRouter for ScriptedRouter {
        fn tool_definitions(&self) -> Vec<ToolDefinition> {
            self.tools.clone()
        }

        async fn call(&self, name: &str, arguments: &Value) -> Result<String, WeftError> {
            self.calls
                .lock()
                .unwrap()
                .push((name.to_string(), arguments.clone()));
            self.results.lock().unwrap().remove(0)
        }
    }

    fn tool_call_response(id: &str, name: &str, args: &str) -> CompletionResponse {
        CompletionResponse {
            tool_calls: vec![ToolCall::new(id, name, args)],
            model: "mock".into(),
            ..Default::default()
        }
    }

    fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            content: text.into(),
            model: "mock".into(),
            ..Default::default()
        }
    }

    #[test]
    fn namespacing_normalizes_server_hyphens_only() {
        assert_eq!(namespaced_tool_name("file-server", "read"), "file_server_read");
        // The tool portion keeps its own characters.
        assert_eq!(
            namespaced_tool_name("fs", "read-file"),
            "fs_read-file"
        );
    }

    #[tokio::test]
    async fn loop_executes_tools_then_returns_text() {
        let provider = MockProvider::new(
            "mock",
            vec![
                Ok(tool_call_response("call_1", "fs_read", r#"{"path":"/x"}"#)),
                Ok(text_response("done")),
            ],
        );
        let router = ScriptedRouter::new(vec!["fs_read"], vec![Ok("file contents".into())]);
        let output = quiet();
        let outcome = run_agentic_loop(
            AgenticRun {
                provider: &provider,
                router: &router,
                system_prompt: None,
                model: None,
                temperature: None,
                max_iterations: 5,
                output: &output,
            },
            vec![Message::user("read /x")],
        )
        .await
        .unwrap();

        assert_eq!(outcome.content, "done");
        assert_eq!(outcome.iterations, 2);
        // Transcript: user, assistant(tool_calls), tool, assistant.
        assert_eq!(outcome.transcript.len(), 4);
        let calls = router.calls.lock().unwrap();
        assert_eq!(calls[0].0, "fs_read");
        assert_eq!(calls[0].1, serde_json::json!({"path": "/x"}));
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back_to_the_model() {
        let provider = MockProvider::new(
            "mock",
            vec![
                Ok(tool_call_response("call_1", "fs_read", "{}")),
                Ok(text_response("recovered")),
            ],
        );
        let router = ScriptedRouter::new(
            vec!["fs_read"],
            vec![Err(WeftError::new(
                ErrorCode::ToolExecutionError,
                "file missing",
            ))],
        );
        let output = quiet();
        let outcome = run_agentic_loop(
            AgenticRun {
                provider: &provider,
                router: &router,
                system_prompt: None,
                model: None,
                temperature: None,
                max_iterations: 5,
                output: &output,
            },
            vec![Message::user("go")],
        )
        .await
        .unwrap();

        assert_eq!(outcome.content, "recovered");
        let tool_msg = &outcome.transcript[2];
        assert!(tool_msg.content_str().starts_with("Error:"));
        assert!(tool_msg.content_str().contains("file missing"));
    }

    #[tokio::test]
    async fn iteration_bound_attaches_partial_transcript() {
        // Always replies with another tool call: can never converge.
        let responses: Vec<_> = (0..3)
            .map(|n| Ok(tool_call_response(&format!("call_{n}"), "loop_tool", "{}")))
            .collect();
        let provider = MockProvider::new("mock", responses);
        let router = ScriptedRouter::new(
            vec!["loop_tool"],
            vec![Ok("again".into()), Ok("again".into()), Ok("again".into())],
        );
        let output = quiet();
        let err = run_agentic_loop(
            AgenticRun {
                provider: &provider,
                router: &router,
                system_prompt: None,
                model: None,
                temperature: None,
                max_iterations: 3,
                output: &output,
            },
            vec![Message::user("go")],
        )
        .await
        .unwrap_err();

        assert_eq!(err.code, ErrorCode::ToolExecutionError);
        assert!(err.context.contains_key("transcript"));
        assert!(err.context["transcript"].contains("loop_tool"));
    }

    #[tokio::test]
    async fn provider_error_is_fatal() {
        let provider = MockProvider::failing("mock", ErrorCode::ProviderApiError);
        let router = NoTools;
        let output = quiet();
        let err = run_agentic_loop(
            AgenticRun {
                provider: &provider,
                router: &router,
                system_prompt: None,
                model: None,
                temperature: None,
                max_iterations: 3,
                output: &output,
            },
            vec![Message::user("go")],
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProviderApiError);
    }

    #[tokio::test]
    async fn composite_router_dispatches_by_advertised_name() {
        let a = Arc::new(ScriptedRouter::new(vec!["alpha_run"], vec![Ok("A".into())]));
        let b = Arc::new(ScriptedRouter::new(vec!["beta_run"], vec![Ok("B".into())]));
        let composite =
            CompositeToolRouter::new(vec![a.clone() as Arc<dyn ToolRouter>, b.clone()]);
        assert_eq!(composite.tool_definitions().len(), 2);
        let result = composite
            .call("beta_run", &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(result, "B");
        let err = composite
            .call("gamma_run", &serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ToolNotFound);
    }
}
