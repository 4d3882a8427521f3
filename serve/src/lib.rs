//! Runas surfaces: re-expose weft's composed capabilities downstream.
//!
//! A [`config::RunAsConfig`] declares what to expose (workflow-backed tools,
//! federated upstream MCP servers, or an auto-discovered skills directory)
//! and how (stdio MCP server or HTTP proxy). [`run`] wires providers,
//! connections, engine, skills, and sandbox into a [`ToolCatalog`] and hands
//! it to the chosen surface.

pub mod catalog;
pub mod mcp_server;
pub mod openapi;
pub mod proxy;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use config::{RunAsConfig, RunasType};
use tracing::info;
use weft::{
    connect_servers, detect_executor, scan_skills, ErrorCode, NoTools, OutputWriter,
    ServerToolRouter, SkillSandbox, ToolRouter, WeftError, WorkflowEngine,
};

pub use catalog::{CatalogContext, ServedTool, ToolCatalog};
pub use mcp_server::{handle_message, serve_stdio, ServerIdentity};
pub use proxy::{build_router, serve_proxy, ProxyState};

/// Runs a runas config to completion (stdio server until EOF, proxy until
/// shutdown).
pub async fn run(
    runas: RunAsConfig,
    runas_path: &Path,
    output: OutputWriter,
) -> Result<(), WeftError> {
    runas.validate().map_err(WeftError::from)?;
    let base_dir = runas_path.parent().unwrap_or(Path::new("."));

    // Application config supplies providers and upstream server commands.
    let app = match &runas.config_source {
        Some(source) => config::load_application_config(&resolve(base_dir, source))?,
        None => config::ApplicationConfig::default(),
    };
    let providers = weft::build_providers(&app)?;

    let upstreams: Vec<Arc<weft::ServerConnection>> =
        connect_servers(&app, &runas.expose, &output)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();

    // Workflows executed by catalog tools route their agentic tool calls to
    // the same upstream connections this surface federates.
    let router: Arc<dyn ToolRouter> = if upstreams.is_empty() {
        Arc::new(NoTools)
    } else {
        Arc::new(ServerToolRouter::discover(upstreams.clone()).await?)
    };
    let engine = Arc::new(WorkflowEngine::new(providers, router, output.clone()));

    // Declared workflow-backed tools. `tools:` and `templates:` are mutually
    // exclusive (validated above), so chaining them reads whichever is set.
    let mut workflows = BTreeMap::new();
    let mut declared: Vec<(String, String, Option<serde_json::Value>)> = Vec::new();
    for spec in &runas.tools {
        let workflow = config::load_workflow(&resolve(base_dir, &spec.workflow))?;
        workflows.insert(spec.name.clone(), workflow);
        declared.push((
            spec.name.clone(),
            spec.description.clone(),
            spec.input_schema.clone(),
        ));
    }
    for spec in &runas.templates {
        let workflow = config::load_workflow(&resolve(base_dir, &spec.workflow))?;
        workflows.insert(spec.name.clone(), workflow);
        declared.push((
            spec.name.clone(),
            spec.description.clone(),
            spec.input_schema.clone(),
        ));
    }

    // Skills variants discover the library and stand up a sandbox.
    let wants_skills = matches!(runas.runas_type, RunasType::McpSkills | RunasType::ProxySkills);
    let (skills, sandbox) = if wants_skills {
        let skills_config = runas.skills_config.clone().ok_or_else(|| {
            WeftError::new(ErrorCode::ConfigInvalid, "skills_config is required")
        })?;
        let skills = scan_skills(
            &resolve(base_dir, &skills_config.directory),
            &skills_config.include_skills,
            &skills_config.exclude_skills,
        )?;
        info!(count = skills.len(), "discovered skills");
        let executor = detect_executor().await?;
        output.progress(&format!("sandbox backend: {}", executor.describe()));
        let outputs_dir = outputs_dir()?;
        let sandbox = Arc::new(SkillSandbox::new(executor, skills_config, outputs_dir));
        (skills, Some(sandbox))
    } else {
        (Vec::new(), None)
    };

    let mut catalog = ToolCatalog::build(CatalogContext {
        engine,
        workflows,
        upstreams,
        skills,
        sandbox,
    })
    .await?;
    for (name, description, schema) in declared {
        catalog.override_description(&name, description);
        if let Some(schema) = schema {
            catalog.override_schema(&name, schema);
        }
    }
    let catalog = Arc::new(catalog);

    match runas.runas_type {
        RunasType::Mcp | RunasType::McpSkills => {
            let identity = ServerIdentity::from_config(runas.server_info.as_ref());
            output.progress(&format!(
                "serving {} tools over stdio MCP",
                catalog.tools().len()
            ));
            serve_stdio(catalog, identity).await
        }
        RunasType::Proxy | RunasType::ProxySkills => {
            let proxy = runas.proxy_config.as_ref().ok_or_else(|| {
                WeftError::new(ErrorCode::ConfigInvalid, "proxy_config is required")
            })?;
            let identity = ServerIdentity::from_config(runas.server_info.as_ref());
            let openapi = openapi::generate(
                &catalog,
                &identity.name,
                &identity.version,
                proxy.base_path.as_deref().unwrap_or(""),
            );
            let state = Arc::new(ProxyState {
                catalog,
                api_key: proxy.api_key.clone(),
                cors_origins: proxy.cors_origins.clone(),
                enable_docs: proxy.enable_docs,
                openapi,
            });
            serve_proxy(state, proxy).await
        }
    }
}

fn resolve(base: &Path, path: &str) -> PathBuf {
    let candidate = PathBuf::from(path);
    if candidate.is_absolute() {
        candidate
    } else {
        base.join(candidate)
    }
}

/// Persistent outputs directory mounted read-write at `/outputs`.
fn outputs_dir() -> Result<PathBuf, WeftError> {
    let dir = std::env::current_dir()
        .map_err(|e| WeftError::new(ErrorCode::Internal, "no working directory").with_cause(e))?
        .join("outputs");
    std::fs::create_dir_all(&dir).map_err(|e| {
        WeftError::new(ErrorCode::Internal, "cannot create outputs directory").with_cause(e)
    })?;
    Ok(dir)
}
