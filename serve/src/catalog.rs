//! Tool catalog: the union of everything a runas surface exposes.
//!
//! Three tool families share one invocation path: workflow-backed tools
//! (declared in `tools:`/`templates:`), tools federated from upstream MCP
//! servers (`expose:`), and tools auto-generated from a skills directory
//! (one `skills_<name>` per skill plus the two meta-tools).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use config::WorkflowDefinition;
use serde_json::{json, Value};
use tracing::debug;
use weft::{
    namespaced_tool_name, ErrorCode, ServerConnection, Skill, SkillSandbox, WeftError,
    WorkflowEngine,
};

/// Prefix for all skill-derived tools.
pub const SKILLS_PREFIX: &str = "skills_";
/// Meta-tool: run model-written code against a skill's helper libraries.
pub const TOOL_EXECUTE_SKILL_CODE: &str = "skills_execute_skill_code";
/// Meta-tool: run one of a skill's bundled scripts.
pub const TOOL_RUN_HELPER_SCRIPT: &str = "skills_run_helper_script";

/// One exposed tool.
pub struct ServedTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    backing: Backing,
}

enum Backing {
    /// Runs a workflow with the request body as `input_data`.
    Workflow(String),
    /// Forwards to an upstream MCP server by bare tool name.
    Upstream { server: usize, bare: String },
    /// Returns a skill's main content (plus requested references).
    SkillContent(usize),
    ExecuteSkillCode,
    RunHelperScript,
}

/// Everything the catalog needs to execute its tools.
pub struct CatalogContext {
    pub engine: Arc<WorkflowEngine>,
    /// Workflow definitions backing declared tools, keyed by tool name.
    pub workflows: BTreeMap<String, WorkflowDefinition>,
    pub upstreams: Vec<Arc<ServerConnection>>,
    pub skills: Vec<Skill>,
    pub sandbox: Option<Arc<SkillSandbox>>,
}

/// The assembled catalog.
pub struct ToolCatalog {
    tools: Vec<ServedTool>,
    context: CatalogContext,
}

/// Fallback input schema for workflow tools that do not declare one.
pub fn default_workflow_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "input": { "type": "string", "description": "Input passed to the workflow as input_data.input" }
        }
    })
}

fn skill_tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "references": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Names of reference files to include with the skill content"
            }
        }
    })
}

fn execute_code_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "skill": { "type": "string", "description": "Skill whose helper libraries the code imports" },
            "code": { "type": "string", "description": "Python source to run in the sandbox workspace" },
            "args": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["skill", "code"]
    })
}

fn run_script_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "skill": { "type": "string" },
            "script": { "type": "string", "description": "Script file name inside the skill's scripts/ directory" },
            "args": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["skill", "script"]
    })
}

impl ToolCatalog {
    /// Builds the catalog: declared workflow tools, federated upstream tools
    /// (namespaced `<server>_<tool>`), and skill tools.
    pub async fn build(context: CatalogContext) -> Result<Self, WeftError> {
        let mut tools = Vec::new();

        for (name, _workflow) in &context.workflows {
            tools.push(ServedTool {
                name: name.clone(),
                description: format!("Runs the {name} workflow"),
                input_schema: default_workflow_schema(),
                backing: Backing::Workflow(name.clone()),
            });
        }

        for (idx, upstream) in context.upstreams.iter().enumerate() {
            let listed = upstream.client().list_tools().await?;
            debug!(server = %upstream.name(), count = listed.len(), "federating tools");
            for info in listed {
                tools.push(ServedTool {
                    name: namespaced_tool_name(upstream.name(), &info.name),
                    description: info.description,
                    input_schema: ensure_object_schema(info.input_schema),
                    backing: Backing::Upstream {
                        server: idx,
                        bare: info.name,
                    },
                });
            }
        }

        for (idx, skill) in context.skills.iter().enumerate() {
            tools.push(ServedTool {
                name: format!("{SKILLS_PREFIX}{}", skill.name.replace('-', "_")),
                description: skill.description.clone(),
                input_schema: skill_tool_schema(),
                backing: Backing::SkillContent(idx),
            });
        }
        if !context.skills.is_empty() && context.sandbox.is_some() {
            tools.push(ServedTool {
                name: TOOL_EXECUTE_SKILL_CODE.to_string(),
                description: "Execute Python code in a sandbox with a skill's helper libraries importable".to_string(),
                input_schema: execute_code_schema(),
                backing: Backing::ExecuteSkillCode,
            });
            tools.push(ServedTool {
                name: TOOL_RUN_HELPER_SCRIPT.to_string(),
                description: "Run one of a skill's bundled helper scripts in a sandbox".to_string(),
                input_schema: run_script_schema(),
                backing: Backing::RunHelperScript,
            });
        }

        Ok(Self { tools, context })
    }

    /// Workflow tools with explicit schemas (from `tools:`/`templates:`
    /// declarations) override the default.
    pub fn override_schema(&mut self, name: &str, schema: Value) {
        if let Some(tool) = self.tools.iter_mut().find(|t| t.name == name) {
            tool.input_schema = ensure_object_schema(schema);
        }
    }

    pub fn override_description(&mut self, name: &str, description: String) {
        if let Some(tool) = self.tools.iter_mut().find(|t| t.name == name) {
            if !description.is_empty() {
                tool.description = description;
            }
        }
    }

    pub fn tools(&self) -> &[ServedTool] {
        &self.tools
    }

    pub fn tool(&self, name: &str) -> Option<&ServedTool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Invokes one tool and reduces the result to text.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<String, WeftError> {
        let tool = self.tool(name).ok_or_else(|| {
            WeftError::new(ErrorCode::ToolNotFound, format!("unknown tool {name:?}"))
        })?;

        match &tool.backing {
            Backing::Workflow(workflow_name) => {
                let workflow = self.context.workflows.get(workflow_name).ok_or_else(|| {
                    WeftError::new(ErrorCode::Internal, "workflow disappeared from catalog")
                })?;
                let outcome = self.context.engine.execute(workflow, arguments).await?;
                Ok(render_output(&outcome.final_output))
            }
            Backing::Upstream { server, bare } => {
                self.context.upstreams[*server]
                    .client()
                    .call_tool(bare, arguments)
                    .await
            }
            Backing::SkillContent(idx) => {
                let skill = &self.context.skills[*idx];
                let mut content = skill.main_content.clone();
                if let Some(names) = arguments.get("references").and_then(Value::as_array) {
                    for name in names.iter().filter_map(Value::as_str) {
                        if let Some(text) = skill.references.get(name) {
                            content.push_str(&format!("\n\n--- {name} ---\n{text}"));
                        }
                    }
                }
                Ok(content)
            }
            Backing::ExecuteSkillCode => self.execute_skill_code(&arguments).await,
            Backing::RunHelperScript => self.run_helper_script(&arguments).await,
        }
    }

    async fn execute_skill_code(&self, arguments: &Value) -> Result<String, WeftError> {
        let (skill, sandbox) = self.skill_and_sandbox(arguments)?;
        let code = arguments
            .get("code")
            .and_then(Value::as_str)
            .ok_or_else(|| WeftError::new(ErrorCode::ToolInvalidArgs, "missing code"))?;
        let args = string_array(arguments.get("args"));

        // Fresh workspace per execution; mounted read-write, discarded after.
        let workspace = tempfile::tempdir().map_err(|e| {
            WeftError::new(ErrorCode::ToolExecutionError, "cannot create workspace").with_cause(e)
        })?;
        std::fs::write(workspace.path().join("main.py"), code).map_err(|e| {
            WeftError::new(ErrorCode::ToolExecutionError, "cannot write code to workspace")
                .with_cause(e)
        })?;
        sandbox
            .execute_python_code(skill, workspace.path(), "main.py", &args)
            .await
    }

    async fn run_helper_script(&self, arguments: &Value) -> Result<String, WeftError> {
        let (skill, sandbox) = self.skill_and_sandbox(arguments)?;
        let script = arguments
            .get("script")
            .and_then(Value::as_str)
            .ok_or_else(|| WeftError::new(ErrorCode::ToolInvalidArgs, "missing script"))?;
        let args = string_array(arguments.get("args"));

        if PathBuf::from(script).components().count() != 1 {
            return Err(WeftError::new(
                ErrorCode::ToolInvalidArgs,
                "script must be a bare file name",
            ));
        }
        if script.ends_with(".sh") || skill.required_language.as_deref() == Some("bash") {
            sandbox.execute_bash(skill, script, &args).await
        } else {
            sandbox.execute_python(skill, script, &args).await
        }
    }

    fn skill_and_sandbox(
        &self,
        arguments: &Value,
    ) -> Result<(&Skill, &Arc<SkillSandbox>), WeftError> {
        let name = arguments
            .get("skill")
            .and_then(Value::as_str)
            .ok_or_else(|| WeftError::new(ErrorCode::ToolInvalidArgs, "missing skill"))?;
        let skill = self
            .context
            .skills
            .iter()
            .find(|s| s.name == name)
            .ok_or_else(|| {
                WeftError::new(ErrorCode::ToolNotFound, format!("unknown skill {name:?}"))
            })?;
        let sandbox = self.context.sandbox.as_ref().ok_or_else(|| {
            WeftError::new(ErrorCode::ToolExecutionError, "no sandbox executor available")
        })?;
        Ok((skill, sandbox))
    }
}

/// Parameters exposed over MCP must be `"type": "object"`.
fn ensure_object_schema(schema: Value) -> Value {
    match schema {
        Value::Object(map) if map.get("type") == Some(&Value::String("object".into())) => {
            Value::Object(map)
        }
        Value::Object(mut map) => {
            map.insert("type".to_string(), Value::String("object".into()));
            Value::Object(map)
        }
        _ => default_workflow_schema(),
    }
}

fn render_output(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_array(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_schema_is_enforced() {
        let kept = ensure_object_schema(json!({"type": "object", "properties": {}}));
        assert_eq!(kept["type"], "object");

        let coerced = ensure_object_schema(json!({"properties": {"a": {}}}));
        assert_eq!(coerced["type"], "object");
        assert!(coerced["properties"]["a"].is_object());

        let replaced = ensure_object_schema(json!("nonsense"));
        assert_eq!(replaced["type"], "object");
    }

    #[test]
    fn output_rendering_keeps_strings_verbatim() {
        assert_eq!(render_output(&json!("plain")), "plain");
        assert_eq!(render_output(&json!({"k": 1})), "{\"k\":1}");
        assert_eq!(render_output(&Value::Null), "");
    }
}
