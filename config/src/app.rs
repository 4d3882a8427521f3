//! Application-level configuration: MCP servers, providers, workflows, skills.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Top-level application configuration (`weft.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// MCP tool servers, keyed by server name.
    #[serde(default)]
    pub servers: BTreeMap<String, ServerConfig>,
    /// LLM providers, keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,
    /// Named workflows: name → path to a workflow YAML file.
    #[serde(default)]
    pub workflows: BTreeMap<String, String>,
    /// Skill library location and filters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skills: Option<SkillsConfig>,
    /// Embeddings passthrough settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingsConfig>,
}

/// How to launch one MCP tool-server subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment merged over the inherited process environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Wire dialect a provider speaks. The factory honors this tag over any
/// name-based default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderInterface {
    OpenaiCompat,
    Anthropic,
    Ollama,
    Gemini,
}

/// Per-provider connection settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Explicit wire dialect; when absent the factory falls back to a
    /// name-based default (e.g. a provider named "anthropic" speaks Anthropic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<ProviderInterface>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Name of an environment variable holding the API key; takes effect when
    /// `api_key` is unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ProviderSettings {
    /// Resolves the API key: explicit value first, then `api_key_env` lookup.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// Skill library configuration (shared by application and runas configs).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillsConfig {
    /// Directory scanned for skill bundles (subdirectories with `SKILL.md`).
    pub directory: String,
    #[serde(default)]
    pub include_skills: Vec<String>,
    #[serde(default)]
    pub exclude_skills: Vec<String>,
    /// Default container image for skill execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
    /// Default network policy ("none" unless overridden).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_network: Option<String>,
    /// Per-skill image/network overrides, keyed by skill name.
    #[serde(default)]
    pub overrides: BTreeMap<String, SkillOverride>,
}

/// Per-skill sandbox override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkillOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

/// Embeddings passthrough: which provider and model serve `create_embeddings`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_application_config() {
        let yaml = r#"
servers:
  filesystem:
    command: "npx"
    args: ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
    env:
      LOG_LEVEL: debug
providers:
  anthropic:
    api_key_env: ANTHROPIC_API_KEY
    default_model: claude-sonnet-4-0
  local:
    interface: ollama
    base_url: "http://localhost:11434"
    default_model: llama3.2
workflows:
  summarize: workflows/summarize.yaml
skills:
  directory: ./skills
  exclude_skills: [experimental]
"#;
        let config: ApplicationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers["filesystem"].command, "npx");
        assert_eq!(config.servers["filesystem"].args.len(), 3);
        assert_eq!(
            config.providers["local"].interface,
            Some(ProviderInterface::Ollama)
        );
        assert!(config.providers["anthropic"].interface.is_none());
        assert_eq!(config.workflows["summarize"], "workflows/summarize.yaml");
        assert_eq!(config.skills.unwrap().exclude_skills, vec!["experimental"]);
    }

    #[test]
    fn resolve_api_key_prefers_literal_over_env() {
        std::env::set_var("WEFT_APP_KEY", "from-env");
        let settings = ProviderSettings {
            api_key: Some("literal".into()),
            api_key_env: Some("WEFT_APP_KEY".into()),
            ..Default::default()
        };
        assert_eq!(settings.resolve_api_key().as_deref(), Some("literal"));

        let settings = ProviderSettings {
            api_key_env: Some("WEFT_APP_KEY".into()),
            ..Default::default()
        };
        assert_eq!(settings.resolve_api_key().as_deref(), Some("from-env"));
    }
}
