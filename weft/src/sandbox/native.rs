//! Native sandbox executor: drives the docker or podman CLI.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::debug;

use super::{ExecOutput, ExecSpec, SandboxExecutor};
use crate::error::{ErrorCode, WeftError};

/// Executor shelling out to `docker` or `podman`, whichever is on PATH.
pub struct NativeCliExecutor {
    binary: PathBuf,
}

impl NativeCliExecutor {
    /// Locates a container runtime on PATH; docker wins over podman.
    pub fn detect() -> Result<Self, WeftError> {
        let binary = which::which("docker")
            .or_else(|_| which::which("podman"))
            .map_err(|e| {
                WeftError::new(
                    ErrorCode::ToolExecutionError,
                    "neither docker nor podman found on PATH",
                )
                .with_cause(e)
            })?;
        Ok(Self { binary })
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }
}

/// Builds the full `run` argument list for one spec. Every run is ephemeral
/// (`--rm`), read-only at the root, capability-free, and resource-capped.
pub(crate) fn build_run_args(spec: &ExecSpec) -> Vec<String> {
    let policy = &spec.policy;
    let mut args = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--read-only".to_string(),
        format!("--network={}", policy.network),
        "--memory".to_string(),
        policy.memory_bytes.to_string(),
        "--cpus".to_string(),
        policy.cpus.to_string(),
        "--pids-limit".to_string(),
        policy.pids_limit.to_string(),
        "--security-opt".to_string(),
        "no-new-privileges".to_string(),
        "--cap-drop".to_string(),
        "ALL".to_string(),
        "--tmpfs".to_string(),
        format!("/tmp:rw,size={}m", policy.tmpfs_mb),
        "-w".to_string(),
        spec.workdir.clone(),
    ];
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &spec.mounts {
        let mut bind = format!("{}:{}", mount.host.display(), mount.container);
        if mount.read_only {
            bind.push_str(":ro");
        }
        args.push("-v".to_string());
        args.push(bind);
    }
    args.push(policy.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

#[async_trait]
impl SandboxExecutor for NativeCliExecutor {
    async fn run(&self, spec: &ExecSpec) -> Result<ExecOutput, WeftError> {
        let args = build_run_args(spec);
        debug!(binary = %self.binary.display(), ?args, "starting sandbox container");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WeftError::new(ErrorCode::ToolExecutionError, "failed to start container runtime")
                    .with_cause(e)
            })?;

        // Readers run as their own tasks so partial logs survive a timeout.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut out = String::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_string(&mut out).await;
            }
            out
        });
        let stderr_task = tokio::spawn(async move {
            let mut err = String::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_string(&mut err).await;
            }
            err
        });

        let (exit_code, timed_out) =
            match tokio::time::timeout(spec.policy.timeout, child.wait()).await {
                Ok(status) => {
                    let status = status.map_err(|e| {
                        WeftError::new(ErrorCode::ToolExecutionError, "container wait failed")
                            .with_cause(e)
                    })?;
                    (status.code().unwrap_or(-1) as i64, false)
                }
                Err(_) => {
                    let _ = child.kill().await;
                    (-1, true)
                }
            };

        // The pipes close once the child dies, so the readers finish either way.
        let mut logs = stdout_task.await.unwrap_or_default();
        let err = stderr_task.await.unwrap_or_default();
        if !err.is_empty() {
            if !logs.is_empty() && !logs.ends_with('\n') {
                logs.push('\n');
            }
            logs.push_str(&err);
        }
        Ok(ExecOutput {
            exit_code,
            logs,
            timed_out,
        })
    }

    fn describe(&self) -> String {
        format!("cli:{}", self.binary.display())
    }
}
