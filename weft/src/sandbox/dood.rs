//! Docker-out-of-Docker executor: container API over a mounted socket.
//!
//! Used when this process itself runs inside a container and no CLI is
//! available. Sockets are tried in order (docker, rootless podman, system
//! podman); the ephemeral container lifecycle is create → start → wait with
//! deadline → logs → remove, and logs are retrieved even on failure.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{socket_candidates, ExecOutput, ExecSpec, SandboxExecutor};
use crate::error::{ErrorCode, WeftError};

pub struct DockerApiExecutor {
    docker: Docker,
    socket: String,
}

impl DockerApiExecutor {
    /// Connects to the first responsive container socket.
    pub async fn connect() -> Result<Self, WeftError> {
        for candidate in socket_candidates() {
            if !candidate.exists() {
                continue;
            }
            let path = candidate.display().to_string();
            match Docker::connect_with_socket(&path, 30, bollard::API_DEFAULT_VERSION) {
                Ok(docker) => match docker.ping().await {
                    Ok(_) => {
                        debug!(socket = %path, "connected to container API");
                        return Ok(Self {
                            docker,
                            socket: path,
                        });
                    }
                    Err(e) => warn!(socket = %path, error = %e, "socket did not answer ping"),
                },
                Err(e) => warn!(socket = %path, error = %e, "socket connection failed"),
            }
        }
        Err(WeftError::new(
            ErrorCode::ToolExecutionError,
            "no responsive container socket found",
        ))
    }

    fn host_config(spec: &ExecSpec) -> HostConfig {
        let policy = &spec.policy;
        let binds: Vec<String> = spec
            .mounts
            .iter()
            .map(|mount| {
                let mut bind = format!("{}:{}", mount.host.display(), mount.container);
                if mount.read_only {
                    bind.push_str(":ro");
                }
                bind
            })
            .collect();
        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,size={}m", policy.tmpfs_mb),
        );
        HostConfig {
            memory: Some(policy.memory_bytes),
            nano_cpus: Some((policy.cpus * 1e9) as i64),
            pids_limit: Some(policy.pids_limit),
            network_mode: Some(policy.network.clone()),
            binds: Some(binds),
            cap_drop: Some(vec!["ALL".to_string()]),
            readonly_rootfs: Some(true),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            tmpfs: Some(tmpfs),
            auto_remove: Some(false),
            ..Default::default()
        }
    }

    async fn collect_logs(&self, container_id: &str) -> String {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => logs.push_str(&output.to_string()),
                Err(e) => {
                    warn!(error = %e, "log retrieval interrupted");
                    break;
                }
            }
        }
        logs
    }

    async fn remove(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self.docker.remove_container(container_id, Some(options)).await {
            warn!(container = %container_id, error = %e, "container removal failed");
        }
    }
}

#[async_trait]
impl SandboxExecutor for DockerApiExecutor {
    async fn run(&self, spec: &ExecSpec) -> Result<ExecOutput, WeftError> {
        let name = format!("weft-sandbox-{}", Uuid::new_v4().simple());
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();

        let config = ContainerCreateBody {
            image: Some(spec.policy.image.clone()),
            cmd: Some(spec.command.clone()),
            working_dir: Some(spec.workdir.clone()),
            env: Some(env),
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(Self::host_config(spec)),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: Some(name.clone()),
                    platform: String::new(),
                }),
                config,
            )
            .await
            .map_err(|e| {
                WeftError::new(ErrorCode::ToolExecutionError, "container create failed")
                    .with_cause(e)
                    .with_context("image", spec.policy.image.clone())
            })?;
        let container_id = created.id;

        if let Err(e) = self
            .docker
            .start_container(&container_id, None::<StartContainerOptions>)
            .await
        {
            self.remove(&container_id).await;
            return Err(
                WeftError::new(ErrorCode::ToolExecutionError, "container start failed")
                    .with_cause(e),
            );
        }

        let wait = async {
            let mut stream = self
                .docker
                .wait_container(&container_id, None::<WaitContainerOptions>);
            match stream.next().await {
                Some(Ok(response)) => response.status_code,
                _ => -1,
            }
        };

        let (exit_code, timed_out) =
            match tokio::time::timeout(spec.policy.timeout, wait).await {
                Ok(code) => (code, false),
                Err(_) => {
                    let _ = self.docker.kill_container(&container_id, None).await;
                    (-1, true)
                }
            };

        // Logs first, cleanup after: diagnostics survive the failure path.
        let logs = self.collect_logs(&container_id).await;
        self.remove(&container_id).await;

        Ok(ExecOutput {
            exit_code,
            logs,
            timed_out,
        })
    }

    fn describe(&self) -> String {
        format!("api:{}", self.socket)
    }
}
