//! Runas configuration: declarative exposure of workflows, skills, and
//! federated MCP servers as a downstream MCP server or HTTP proxy.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ConfigError, SkillsConfig};

/// Which surface a runas config stands up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunasType {
    /// Stdio MCP server exposing configured tools/templates and federated servers.
    Mcp,
    /// Stdio MCP server whose tools are auto-generated from a skills directory.
    McpSkills,
    /// HTTP proxy exposing `POST /<tool>` per discovered tool.
    Proxy,
    /// Proxy variant auto-discovering skills.
    ProxySkills,
}

/// Declarative exposure contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunAsConfig {
    pub runas_type: RunasType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,

    /// Legacy workflow-backed tool declarations.
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Newer workflow-backed tool declarations. Mutually exclusive with
    /// `tools` until an authoritative precedence is specified.
    #[serde(default)]
    pub templates: Vec<TemplateSpec>,
    /// Names of upstream MCP servers (from `config_source`) whose tools are
    /// federated through this surface.
    #[serde(default)]
    pub expose: Vec<String>,
    /// Path to the application config supplying servers/providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_config: Option<ProxyConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills_config: Option<SkillsConfig>,
}

/// Identity advertised in the MCP `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Legacy tool declaration: a named workflow exposed as one tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Path to the backing workflow YAML.
    pub workflow: String,
    /// JSON-Schema object for the tool input; defaults to a single free-form
    /// `input` string when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Newer tool declaration; same shape as [`ToolSpec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// HTTP proxy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// Single API key; `${NAME}` / `$NAME` expanded from the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
    #[serde(default)]
    pub enable_docs: bool,
    /// Prefix applied to every route.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_cert: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

impl RunAsConfig {
    /// Type-specific validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tools.is_empty() && !self.templates.is_empty() {
            return Err(ConfigError::Invalid(
                "both tools and templates are set; precedence is unspecified, use one".into(),
            ));
        }
        match self.runas_type {
            RunasType::Mcp => {
                if self.tools.is_empty() && self.templates.is_empty() && self.expose.is_empty() {
                    return Err(ConfigError::Invalid(
                        "runas_type mcp requires tools, templates, or expose".into(),
                    ));
                }
                if !self.expose.is_empty() && self.config_source.is_none() {
                    return Err(ConfigError::Invalid(
                        "expose requires config_source naming the upstream servers".into(),
                    ));
                }
            }
            RunasType::McpSkills => {
                if self.skills_config.is_none() {
                    return Err(ConfigError::Invalid(
                        "runas_type mcp-skills requires skills_config".into(),
                    ));
                }
            }
            RunasType::Proxy => {
                let proxy = self.proxy_config.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("runas_type proxy requires proxy_config".into())
                })?;
                validate_proxy(proxy)?;
                if self.tools.is_empty() && self.templates.is_empty() && self.expose.is_empty() {
                    return Err(ConfigError::Invalid(
                        "runas_type proxy requires tools, templates, or expose".into(),
                    ));
                }
            }
            RunasType::ProxySkills => {
                let proxy = self.proxy_config.as_ref().ok_or_else(|| {
                    ConfigError::Invalid("runas_type proxy-skills requires proxy_config".into())
                })?;
                validate_proxy(proxy)?;
                if self.skills_config.is_none() {
                    return Err(ConfigError::Invalid(
                        "runas_type proxy-skills requires skills_config".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn validate_proxy(proxy: &ProxyConfig) -> Result<(), ConfigError> {
    if proxy.tls_cert.is_some() != proxy.tls_key.is_some() {
        return Err(ConfigError::Invalid(
            "tls_cert and tls_key must be set together".into(),
        ));
    }
    Ok(())
}
