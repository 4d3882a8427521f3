//! Sandboxed skill execution in ephemeral OCI containers.
//!
//! Two executors behind one trait: the native CLI path (docker or podman on
//! PATH) when running on a host, and the Docker-out-of-Docker path (API over
//! a mounted socket) when this process itself runs inside a container. The
//! dual-mount policy is load-bearing for the security model: the skill
//! library is read-only at `/skill`, the workspace read-write at
//! `/workspace`, and `PYTHONPATH=/skill` keeps `import scripts.*` natural.

pub mod dood;
pub mod native;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{ErrorCode, WeftError};
use crate::skill::Skill;

pub use dood::DockerApiExecutor;
pub use native::NativeCliExecutor;

/// Default container image when no mapping overrides it.
pub const DEFAULT_IMAGE: &str = "python:3.12-slim";
/// Container-side mount points.
pub const WORKSPACE_MOUNT: &str = "/workspace";
pub const SKILL_MOUNT: &str = "/skill";
pub const OUTPUTS_MOUNT: &str = "/outputs";

/// Resource and network policy for one execution.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub image: String,
    /// Container network mode; `"none"` unless a mapping opens it up.
    pub network: String,
    pub memory_bytes: i64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub timeout: Duration,
    /// tmpfs size for `/tmp`, in megabytes.
    pub tmpfs_mb: u64,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            network: "none".to_string(),
            memory_bytes: 256 * 1024 * 1024,
            cpus: 0.5,
            pids_limit: 100,
            timeout: Duration::from_secs(120),
            tmpfs_mb: 100,
        }
    }
}

/// One bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            host: host.into(),
            container: container.to_string(),
            read_only: true,
        }
    }

    pub fn read_write(host: impl Into<PathBuf>, container: &str) -> Self {
        Self {
            host: host.into(),
            container: container.to_string(),
            read_only: false,
        }
    }
}

/// Everything an executor needs to run one container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub policy: SandboxPolicy,
    pub command: Vec<String>,
    pub mounts: Vec<Mount>,
    pub env: Vec<(String, String)>,
    pub workdir: String,
}

/// Captured result of one container run. Logs are always retrieved, success
/// or not.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub logs: String,
    pub timed_out: bool,
}

/// One container execution backend.
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn run(&self, spec: &ExecSpec) -> Result<ExecOutput, WeftError>;

    /// Human-readable backend description for connection messages.
    fn describe(&self) -> String;
}

/// True when this process runs inside a container (`/.dockerenv` or cgroup
/// markers).
pub fn running_in_container() -> bool {
    if Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|content| cgroup_indicates_container(&content))
        .unwrap_or(false)
}

pub(crate) fn cgroup_indicates_container(content: &str) -> bool {
    ["docker", "containerd", "kubepods"]
        .iter()
        .any(|marker| content.contains(marker))
}

/// Picks the executor for this environment: Docker-out-of-Docker via a
/// mounted socket when containerized, the docker/podman CLI otherwise.
pub async fn detect_executor() -> Result<Box<dyn SandboxExecutor>, WeftError> {
    if running_in_container() {
        let executor = DockerApiExecutor::connect().await?;
        debug!(backend = %executor.describe(), "selected container-API sandbox executor");
        Ok(Box::new(executor))
    } else {
        let executor = NativeCliExecutor::detect()?;
        debug!(backend = %executor.describe(), "selected CLI sandbox executor");
        Ok(Box::new(executor))
    }
}

/// High-level skill execution over whichever backend was detected.
pub struct SkillSandbox {
    executor: Box<dyn SandboxExecutor>,
    skills: config::SkillsConfig,
    /// Persistent outputs directory mounted read-write at `/outputs`.
    outputs_dir: PathBuf,
}

impl SkillSandbox {
    pub fn new(
        executor: Box<dyn SandboxExecutor>,
        skills: config::SkillsConfig,
        outputs_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            skills,
            outputs_dir,
        }
    }

    /// Per-skill policy: the skills config default image/network, overridden
    /// by the skill's mapping entry when present.
    pub fn policy_for(&self, skill_name: &str) -> SandboxPolicy {
        let mut policy = SandboxPolicy::default();
        if let Some(image) = &self.skills.default_image {
            policy.image = image.clone();
        }
        if let Some(network) = &self.skills.default_network {
            policy.network = network.clone();
        }
        if let Some(override_) = self.skills.overrides.get(skill_name) {
            if let Some(image) = &override_.image {
                policy.image = image.clone();
            }
            if let Some(network) = &override_.network {
                policy.network = network.clone();
            }
        }
        policy
    }

    /// Legacy single-mount execution: the skill directory is mounted
    /// read-only and a bundled script runs against it.
    pub async fn execute_python(
        &self,
        skill: &Skill,
        script_name: &str,
        args: &[String],
    ) -> Result<String, WeftError> {
        let script = skill.script(script_name).ok_or_else(|| {
            WeftError::new(
                ErrorCode::ToolNotFound,
                format!("skill {:?} has no script {script_name:?}", skill.name),
            )
        })?;
        let relative = script
            .strip_prefix(&skill.directory)
            .unwrap_or(script)
            .to_string_lossy()
            .to_string();
        let spec = script_exec_spec(
            self.policy_for(&skill.name),
            &skill.directory,
            &self.outputs_dir,
            "python3",
            &format!("{SKILL_MOUNT}/{relative}"),
            args,
        );
        self.finish(spec).await
    }

    /// Bash variant of [`SkillSandbox::execute_python`].
    pub async fn execute_bash(
        &self,
        skill: &Skill,
        script_name: &str,
        args: &[String],
    ) -> Result<String, WeftError> {
        let script = skill.script(script_name).ok_or_else(|| {
            WeftError::new(
                ErrorCode::ToolNotFound,
                format!("skill {:?} has no script {script_name:?}", skill.name),
            )
        })?;
        let relative = script
            .strip_prefix(&skill.directory)
            .unwrap_or(script)
            .to_string_lossy()
            .to_string();
        let spec = script_exec_spec(
            self.policy_for(&skill.name),
            &skill.directory,
            &self.outputs_dir,
            "bash",
            &format!("{SKILL_MOUNT}/{relative}"),
            args,
        );
        self.finish(spec).await
    }

    /// Dual-mount code execution: model-written code in a read-write
    /// workspace importing the skill's helper libraries read-only.
    pub async fn execute_python_code(
        &self,
        skill: &Skill,
        workspace_dir: &Path,
        script_name: &str,
        args: &[String],
    ) -> Result<String, WeftError> {
        let spec = code_exec_spec(
            self.policy_for(&skill.name),
            workspace_dir,
            &skill.directory,
            &self.outputs_dir,
            "python3",
            &format!("{WORKSPACE_MOUNT}/{script_name}"),
            args,
        );
        self.finish(spec).await
    }

    /// Bash variant of [`SkillSandbox::execute_python_code`].
    pub async fn execute_bash_code(
        &self,
        skill: &Skill,
        workspace_dir: &Path,
        script_name: &str,
        args: &[String],
    ) -> Result<String, WeftError> {
        let spec = code_exec_spec(
            self.policy_for(&skill.name),
            workspace_dir,
            &skill.directory,
            &self.outputs_dir,
            "bash",
            &format!("{WORKSPACE_MOUNT}/{script_name}"),
            args,
        );
        self.finish(spec).await
    }

    async fn finish(&self, spec: ExecSpec) -> Result<String, WeftError> {
        let output = self.executor.run(&spec).await?;
        if output.timed_out {
            return Err(WeftError::new(
                ErrorCode::ToolExecutionError,
                format!("sandbox timed out after {:?}", spec.policy.timeout),
            )
            .with_context("logs", output.logs));
        }
        if output.exit_code != 0 {
            return Err(WeftError::new(
                ErrorCode::ToolExecutionError,
                format!("sandbox exited with status {}", output.exit_code),
            )
            .with_context("logs", output.logs));
        }
        Ok(output.logs)
    }
}

/// Single-mount spec: skill read-only at `/skill`, outputs read-write.
pub(crate) fn script_exec_spec(
    policy: SandboxPolicy,
    skill_dir: &Path,
    outputs_dir: &Path,
    interpreter: &str,
    script: &str,
    args: &[String],
) -> ExecSpec {
    let mut command = vec![interpreter.to_string(), script.to_string()];
    command.extend(args.iter().cloned());
    ExecSpec {
        policy,
        command,
        mounts: vec![
            Mount::read_only(skill_dir, SKILL_MOUNT),
            Mount::read_write(outputs_dir, OUTPUTS_MOUNT),
        ],
        env: vec![("PYTHONPATH".to_string(), SKILL_MOUNT.to_string())],
        workdir: SKILL_MOUNT.to_string(),
    }
}

/// Dual-mount spec: workspace read-write (working directory), skill library
/// read-only, outputs read-write, `PYTHONPATH=/skill`.
pub(crate) fn code_exec_spec(
    policy: SandboxPolicy,
    workspace_dir: &Path,
    skill_dir: &Path,
    outputs_dir: &Path,
    interpreter: &str,
    script: &str,
    args: &[String],
) -> ExecSpec {
    let mut command = vec![interpreter.to_string(), script.to_string()];
    command.extend(args.iter().cloned());
    ExecSpec {
        policy,
        command,
        mounts: vec![
            Mount::read_write(workspace_dir, WORKSPACE_MOUNT),
            Mount::read_only(skill_dir, SKILL_MOUNT),
            Mount::read_write(outputs_dir, OUTPUTS_MOUNT),
        ],
        env: vec![("PYTHONPATH".to_string(), SKILL_MOUNT.to_string())],
        workdir: WORKSPACE_MOUNT.to_string(),
    }
}

/// Candidate container sockets, tried in order, for the DooD path.
pub(crate) fn socket_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/var/run/docker.sock")];
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata("/proc/self") {
            candidates.push(PathBuf::from(format!(
                "/run/user/{}/podman/podman.sock",
                meta.uid()
            )));
        }
    }
    candidates.push(PathBuf::from("/run/podman/podman.sock"));
    candidates
}
