//! CLI argument surface and command implementations for the `weft` binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::debug;
use weft::{
    connect_servers, scan_skills, ErrorCode, LlmProvider, NoTools, OutputWriter, ServerConnection,
    ServerToolRouter, ToolRouter, Verbosity, WeftError, WorkflowEngine,
};

/// Commands run under this wall-clock ceiling unless overridden.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Parser, Debug)]
#[command(name = "weft", version, about = "Bridge LLM providers and MCP tool servers")]
pub struct Cli {
    /// Mirror all subprocess stderr and print execution detail.
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Only real errors on stderr.
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Application config file.
    #[arg(long, global = true, default_value = "weft.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a workflow file and print its final output.
    Run {
        workflow: PathBuf,
        /// Input data entries, `key=value`, exposed as `{{input_data.key}}`.
        #[arg(long = "input", short = 'i')]
        inputs: Vec<String>,
        /// Override the command timeout, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Serve a runas config (stdio MCP server or HTTP proxy).
    Serve { runas: PathBuf },
    /// List tools exposed by the configured MCP servers.
    Tools {
        /// Restrict to these server names (all configured servers otherwise).
        servers: Vec<String>,
    },
    /// List skills discovered in a directory.
    Skills { directory: PathBuf },
    /// Send one prompt to a provider and stream the answer.
    Chat {
        prompt: String,
        /// Provider name from the application config.
        #[arg(long, short)]
        provider: Option<String>,
        #[arg(long, short)]
        model: Option<String>,
    },
}

impl Cli {
    pub fn verbosity(&self) -> Verbosity {
        if self.verbose {
            Verbosity::Verbose
        } else if self.quiet {
            Verbosity::Quiet
        } else {
            Verbosity::Normal
        }
    }
}

/// Runs the parsed command; the returned error carries the exit code.
pub async fn execute(cli: Cli) -> Result<(), WeftError> {
    let output = OutputWriter::new(cli.verbosity());
    match &cli.command {
        Command::Run {
            workflow,
            inputs,
            timeout,
        } => {
            let ceiling = timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT);
            let work = run_workflow(&cli.config, workflow, inputs, &output);
            tokio::select! {
                result = tokio::time::timeout(ceiling, work) => {
                    result.map_err(|_| {
                        WeftError::new(ErrorCode::ProviderTimeout, "command timeout exceeded")
                    })?
                }
                _ = tokio::signal::ctrl_c() => {
                    output.error("interrupted");
                    Err(WeftError::new(ErrorCode::Unknown, "interrupted"))
                }
            }
        }
        Command::Serve { runas } => {
            let parsed = config::load_runas_config(runas)?;
            serve::run(parsed, runas, output).await
        }
        Command::Tools { servers } => list_tools(&cli.config, servers, &output).await,
        Command::Skills { directory } => {
            let skills = scan_skills(directory, &[], &[])?;
            for skill in skills {
                println!("{}: {}", skill.name, skill.description);
            }
            Ok(())
        }
        Command::Chat {
            prompt,
            provider,
            model,
        } => chat(&cli.config, prompt, provider.as_deref(), model.clone(), &output).await,
    }
}

/// Parses `key=value` input pairs into the workflow's `input_data` object.
pub fn parse_inputs(inputs: &[String]) -> Result<Value, WeftError> {
    let mut map = serde_json::Map::new();
    for entry in inputs {
        let (key, value) = entry.split_once('=').ok_or_else(|| {
            WeftError::new(
                ErrorCode::RequestInvalid,
                format!("input {entry:?} is not key=value"),
            )
        })?;
        // Values that parse as JSON stay structured; everything else is a string.
        let parsed = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        map.insert(key.to_string(), parsed);
    }
    Ok(Value::Object(map))
}

async fn run_workflow(
    config_path: &Path,
    workflow_path: &Path,
    inputs: &[String],
    output: &OutputWriter,
) -> Result<(), WeftError> {
    let workflow = config::load_workflow(workflow_path)?;
    let app = load_app_config(config_path)?;
    let providers = weft::build_providers(&app)?;
    let input_data = parse_inputs(inputs)?;

    let connections: Vec<Arc<ServerConnection>> =
        connect_servers(&app, &workflow.execution.servers, output)
            .await?
            .into_iter()
            .map(Arc::new)
            .collect();
    let router: Arc<dyn ToolRouter> = if connections.is_empty() {
        Arc::new(NoTools)
    } else {
        Arc::new(ServerToolRouter::discover(connections.clone()).await?)
    };

    let engine = WorkflowEngine::new(providers, router, output.clone());
    let result = engine.execute(&workflow, input_data).await;

    for connection in &connections {
        connection.shutdown().await;
    }

    let outcome = result?;
    // Stdout carries the program output only.
    match &outcome.final_output {
        Value::String(s) => println!("{s}"),
        other => println!("{}", serde_json::to_string_pretty(other).unwrap_or_default()),
    }
    Ok(())
}

async fn list_tools(
    config_path: &Path,
    servers: &[String],
    output: &OutputWriter,
) -> Result<(), WeftError> {
    let app = load_app_config(config_path)?;
    let names: Vec<String> = if servers.is_empty() {
        app.servers.keys().cloned().collect()
    } else {
        servers.to_vec()
    };

    let connections = connect_servers(&app, &names, output).await?;
    for connection in &connections {
        let tools = connection.client().list_tools().await?;
        println!("{}:", connection.name());
        for tool in tools {
            println!("  {} - {}", tool.name, tool.description);
        }
    }
    for connection in &connections {
        connection.shutdown().await;
    }
    Ok(())
}

async fn chat(
    config_path: &Path,
    prompt: &str,
    provider_name: Option<&str>,
    model: Option<String>,
    output: &OutputWriter,
) -> Result<(), WeftError> {
    let app = load_app_config(config_path)?;
    let providers = weft::build_providers(&app)?;

    let provider: &Arc<dyn LlmProvider> = match provider_name {
        Some(name) => providers.get(name).ok_or_else(|| {
            WeftError::new(
                ErrorCode::ProviderNotFound,
                format!("provider {name:?} is not configured"),
            )
        })?,
        None => {
            let mut names: Vec<&String> = providers.keys().collect();
            names.sort();
            let first = names.first().ok_or_else(|| {
                WeftError::new(ErrorCode::ProviderNotFound, "no providers configured")
            })?;
            &providers[*first]
        }
    };
    debug!(provider = %provider.name(), "chat");
    output.progress(&format!("using provider {}", provider.name()));

    let request = weft::CompletionRequest {
        messages: vec![weft::Message::user(prompt)],
        model,
        ..Default::default()
    };
    let response = provider
        .stream_completion(&request, &|chunk: &str| {
            use std::io::Write;
            print!("{chunk}");
            let _ = std::io::stdout().flush();
        })
        .await?;
    if !response.content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn load_app_config(path: &Path) -> Result<config::ApplicationConfig, WeftError> {
    if path.exists() {
        Ok(config::load_application_config(path)?)
    } else {
        debug!(path = %path.display(), "no application config; using defaults");
        Ok(config::ApplicationConfig::default())
    }
}

/// Maps a final error to the process exit code contract: 0 success,
/// 1 generic, 2 configuration, 3 network/provider fatal.
pub fn exit_code_for(result: &Result<(), WeftError>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code.exit_code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_parse_to_structured_values() {
        let parsed = parse_inputs(&[
            "q=hello".to_string(),
            "count=3".to_string(),
            "items=[1,2]".to_string(),
        ])
        .unwrap();
        assert_eq!(parsed["q"], "hello");
        assert_eq!(parsed["count"], 3);
        assert_eq!(parsed["items"], json!([1, 2]));
    }

    #[test]
    fn malformed_input_is_request_invalid() {
        let err = parse_inputs(&["no-equals".to_string()]).unwrap_err();
        assert_eq!(err.code, ErrorCode::RequestInvalid);
    }

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code_for(&Ok(())), 0);
        assert_eq!(
            exit_code_for(&Err(WeftError::new(ErrorCode::ConfigInvalid, "x"))),
            2
        );
        assert_eq!(
            exit_code_for(&Err(WeftError::new(ErrorCode::ProviderTimeout, "x"))),
            3
        );
        assert_eq!(
            exit_code_for(&Err(WeftError::new(ErrorCode::ToolNotFound, "x"))),
            1
        );
    }

    #[test]
    fn verbosity_flags_map_to_levels() {
        let cli = Cli::parse_from(["weft", "--verbose", "skills", "/tmp"]);
        assert_eq!(cli.verbosity(), Verbosity::Verbose);
        let cli = Cli::parse_from(["weft", "--quiet", "skills", "/tmp"]);
        assert_eq!(cli.verbosity(), Verbosity::Quiet);
        let cli = Cli::parse_from(["weft", "skills", "/tmp"]);
        assert_eq!(cli.verbosity(), Verbosity::Normal);
    }

    #[test]
    fn run_command_parses_inputs_and_timeout() {
        let cli = Cli::parse_from([
            "weft", "run", "wf.yaml", "-i", "q=x", "--input", "n=2", "--timeout", "60",
        ]);
        match cli.command {
            Command::Run {
                workflow,
                inputs,
                timeout,
            } => {
                assert_eq!(workflow, PathBuf::from("wf.yaml"));
                assert_eq!(inputs, vec!["q=x", "n=2"]);
                assert_eq!(timeout, Some(60));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
