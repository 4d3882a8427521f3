//! Configuration data layer for weft.
//!
//! Pure serde types plus loading and validation; no runtime behavior lives
//! here. Three YAML schemas:
//!
//! - [`ApplicationConfig`]: MCP servers, LLM providers, workflow and skill
//!   locations. Loaded by the CLI and by runas configs via `config_source`.
//! - [`WorkflowDefinition`]: a `workflow/v2.0` step DAG, consumed by the
//!   workflow engine.
//! - [`RunAsConfig`]: declarative exposure contract (stdio MCP server or
//!   HTTP proxy), with `runas_type`-specific validation.
//!
//! The crate also owns process-environment setup: [`load_and_apply`] reads
//! the project `.env` and the `[env]` table of
//! `$XDG_CONFIG_HOME/<app>/config.toml` and applies them with priority
//! **existing env > `.env` > XDG**, so a key already exported is never
//! overwritten.
//!
//! Environment-variable expansion (`${NAME}` / `$NAME`) is applied to the
//! proxy `api_key` only; every other field is literal.

mod app;
mod env;
mod envfile;
mod runas;
mod workflow;
mod xdg;

use std::path::Path;

use thiserror::Error;

pub use app::{
    ApplicationConfig, EmbeddingsConfig, ProviderInterface, ProviderSettings, ServerConfig,
    SkillOverride, SkillsConfig,
};
pub use env::expand_env;
pub use runas::{ProxyConfig, RunAsConfig, RunasType, ServerInfo, TemplateSpec, ToolSpec};
pub use workflow::{
    AggregateMode, ConsensusExecution, ConsensusSpec, ErrorHandling, ExecutionDefaults, OnFailure,
    ParallelSpec, StepDefinition, WorkflowDefinition, WORKFLOW_SCHEMA_V2,
};

/// Errors from loading or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("read config: {0}")]
    Read(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors from environment loading ([`load_and_apply`]).
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("config dir: {0}")]
    ConfigDir(String),
    #[error("read config.toml: {0}")]
    XdgRead(std::io::Error),
    #[error("parse config.toml: {0}")]
    XdgParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    DotenvRead(std::io::Error),
}

/// Loads `.env` and the XDG `config.toml` `[env]` table, then sets process
/// environment variables only for keys that are **not** already set.
///
/// Order of precedence when a key is missing from the process environment:
/// 1. Value from the project `.env` (current directory, or `override_dir`
///    when given)
/// 2. Value from `$XDG_CONFIG_HOME/<app_name>/config.toml` `[env]`
///
/// Missing files are not errors; unreadable or unparseable ones are.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let xdg_map = xdg::load_env_map(app_name)?;
    let dotenv_map = envfile::load_env_map(override_dir).map_err(LoadError::DotenvRead)?;

    let mut keys: std::collections::BTreeSet<&String> = xdg_map.keys().collect();
    keys.extend(dotenv_map.keys());

    for key in keys {
        if std::env::var_os(key).is_some() {
            continue; // existing env wins
        }
        if let Some(value) = dotenv_map.get(key).or_else(|| xdg_map.get(key)) {
            std::env::set_var(key, value);
        }
    }
    Ok(())
}

fn read_to_string(path: &Path) -> Result<String, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    Ok(std::fs::read_to_string(path)?)
}

/// Loads an [`ApplicationConfig`] from a YAML file.
pub fn load_application_config(path: &Path) -> Result<ApplicationConfig, ConfigError> {
    let text = read_to_string(path)?;
    let config: ApplicationConfig = serde_yaml::from_str(&text)?;
    Ok(config)
}

/// Loads a [`WorkflowDefinition`] from a YAML file and validates its schema tag.
pub fn load_workflow(path: &Path) -> Result<WorkflowDefinition, ConfigError> {
    let text = read_to_string(path)?;
    let workflow: WorkflowDefinition = serde_yaml::from_str(&text)?;
    workflow.validate()?;
    Ok(workflow)
}

/// Loads a [`RunAsConfig`] from a YAML file and runs type-specific validation.
pub fn load_runas_config(path: &Path) -> Result<RunAsConfig, ConfigError> {
    let text = read_to_string(path)?;
    let mut config: RunAsConfig = serde_yaml::from_str(&text)?;
    config.validate()?;
    if let Some(proxy) = config.proxy_config.as_mut() {
        if let Some(key) = proxy.api_key.take() {
            proxy.api_key = Some(env::expand_env(&key));
        }
    }
    Ok(config)
}

#[cfg(test)]
pub(crate) mod tests_support {
    //! Serializes tests that touch the process environment; env vars are
    //! global, and the XDG tests all steer `XDG_CONFIG_HOME`.

    use std::path::Path;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` with `XDG_CONFIG_HOME` pointed at `dir`, restoring the
    /// previous value afterwards. Holds the env lock for the duration.
    pub fn with_xdg_config_home<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let _guard = env_lock();
        let previous = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", dir);
        let result = f();
        match previous {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        result
    }
}

#[cfg(test)]
mod env_loading_tests {
    use super::tests_support::with_xdg_config_home;
    use super::*;

    fn write_xdg_config(root: &Path, app: &str, body: &str) {
        let app_dir = root.join(app);
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), body).unwrap();
    }

    #[test]
    fn existing_env_wins_over_dotenv() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "WEFT_PRIO_A=from_dotenv\n").unwrap();
        std::env::set_var("WEFT_PRIO_A", "from_env");

        load_and_apply("weft-prio-a", Some(dir.path())).unwrap();
        assert_eq!(std::env::var("WEFT_PRIO_A").unwrap(), "from_env");
        std::env::remove_var("WEFT_PRIO_A");
    }

    #[test]
    fn dotenv_applies_when_env_is_unset() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "WEFT_PRIO_B=from_dotenv\n").unwrap();
        std::env::remove_var("WEFT_PRIO_B");

        load_and_apply("weft-prio-b", Some(dir.path())).unwrap();
        assert_eq!(std::env::var("WEFT_PRIO_B").unwrap(), "from_dotenv");
        std::env::remove_var("WEFT_PRIO_B");
    }

    #[test]
    fn dotenv_wins_over_xdg() {
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(".env"), "WEFT_PRIO_C=from_dotenv\n").unwrap();
        let xdg = tempfile::tempdir().unwrap();
        write_xdg_config(
            xdg.path(),
            "weft-prio-c",
            "[env]\nWEFT_PRIO_C = \"from_xdg\"\n",
        );
        std::env::remove_var("WEFT_PRIO_C");

        with_xdg_config_home(xdg.path(), || {
            load_and_apply("weft-prio-c", Some(project.path())).unwrap();
        });
        assert_eq!(std::env::var("WEFT_PRIO_C").unwrap(), "from_dotenv");
        std::env::remove_var("WEFT_PRIO_C");
    }

    #[test]
    fn xdg_applies_when_nothing_else_sets_the_key() {
        let project = tempfile::tempdir().unwrap();
        let xdg = tempfile::tempdir().unwrap();
        write_xdg_config(
            xdg.path(),
            "weft-prio-d",
            "[env]\nWEFT_PRIO_D = \"from_xdg\"\n",
        );
        std::env::remove_var("WEFT_PRIO_D");

        with_xdg_config_home(xdg.path(), || {
            load_and_apply("weft-prio-d", Some(project.path())).unwrap();
        });
        assert_eq!(std::env::var("WEFT_PRIO_D").unwrap(), "from_xdg");
        std::env::remove_var("WEFT_PRIO_D");
    }

    #[test]
    fn existing_env_wins_over_xdg() {
        let project = tempfile::tempdir().unwrap();
        let xdg = tempfile::tempdir().unwrap();
        write_xdg_config(
            xdg.path(),
            "weft-prio-e",
            "[env]\nWEFT_PRIO_E = \"from_xdg\"\n",
        );
        std::env::set_var("WEFT_PRIO_E", "from_env");

        with_xdg_config_home(xdg.path(), || {
            load_and_apply("weft-prio-e", Some(project.path())).unwrap();
        });
        assert_eq!(std::env::var("WEFT_PRIO_E").unwrap(), "from_env");
        std::env::remove_var("WEFT_PRIO_E");
    }

    #[test]
    fn missing_sources_are_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        load_and_apply("weft-prio-nonexistent-40291", Some(dir.path())).unwrap();
    }
}
