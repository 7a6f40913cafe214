use std::os::unix::fs::PermissionsExt;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use sandbox::process::{exit_from_status, kill_process_group, stream_output};
use sandbox::{OutputLine, ProcessExit, Sandbox, SandboxConfig, SandboxError};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::command::exec_ignore_errors;
use crate::config::DockerConfig;

/// Label attached to every container so orphans can be found by execution id.
pub const LABEL_KEY: &str = "playguard.execution-id";

/// Mount point of the scratch artifact inside the container.
const CONTAINER_WORKDIR: &str = "/work";

const OUTPUT_BUFFER: usize = 256;

/// Docker-safe container name derived from the execution id.
pub fn container_name(execution_id: &str) -> String {
    let mut name = String::from("playguard-");
    name.extend(execution_id.chars().take(64).map(|c| {
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            c
        } else {
            '-'
        }
    }));
    name
}

/// `--cpus` value for a percentage of one CPU.
fn cpus(percent: u32) -> String {
    format!("{:.2}", f64::from(percent.clamp(1, 100)) / 100.0)
}

/// Full `docker run` argument vector for one execution.
pub(crate) fn run_args(docker: &DockerConfig, config: &SandboxConfig, name: &str) -> Vec<String> {
    let limits = &config.resources;
    let artifact_in = format!("{CONTAINER_WORKDIR}/{}", config.artifact);
    let output_in = format!("{CONTAINER_WORKDIR}/out");

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        name.to_string(),
        "--label".into(),
        format!("{LABEL_KEY}={}", config.execution_id),
        "--network".into(),
        "none".into(),
        "--read-only".into(),
        "--tmpfs".into(),
        format!("/tmp:rw,noexec,nosuid,nodev,size={}m", docker.tmpfs_mb),
        "--shm-size".into(),
        format!("{}m", docker.shm_mb),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", limits.memory_mb),
        "--cpus".into(),
        cpus(limits.cpu_percent),
        "--pids-limit".into(),
        docker.pids_limit.to_string(),
        "--cap-drop".into(),
        "ALL".into(),
    ];
    for cap in &docker.capabilities {
        args.push("--cap-add".into());
        args.push(cap.clone());
    }
    args.push("--security-opt".into());
    args.push("no-new-privileges".into());
    if let Some(profile) = &docker.seccomp_profile {
        args.push("--security-opt".into());
        args.push(format!("seccomp={}", profile.display()));
    }
    args.extend([
        "--user".into(),
        docker.user.clone(),
        "--env".into(),
        "HOME=/tmp".into(),
        "--env".into(),
        format!("PLAYGUARD_EXECUTION_ID={}", config.execution_id),
        "--volume".into(),
        format!("{}:{artifact_in}:ro", config.artifact_path().display()),
        "--volume".into(),
        format!("{}:{output_in}:rw", config.output_dir().display()),
        "--workdir".into(),
        CONTAINER_WORKDIR.into(),
        docker.image.clone(),
    ]);
    args.extend(docker.command.iter().map(|arg| {
        arg.replace("{artifact}", &artifact_in)
            .replace("{output}", &output_in)
            .replace("{browser}", &config.browser_engine)
    }));
    args
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Exited = 2,
}

pub struct DockerSandbox {
    config: SandboxConfig,
    docker: Arc<DockerConfig>,
    pub(crate) name: String,
    child: Option<Child>,
    pid: Option<u32>,
    state: AtomicU8,
}

impl DockerSandbox {
    pub(crate) fn new(config: SandboxConfig, docker: Arc<DockerConfig>) -> Self {
        let name = container_name(&config.execution_id);
        Self {
            config,
            docker,
            name,
            child: None,
            pid: None,
            state: AtomicU8::new(SandboxState::Created as u8),
        }
    }

    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn fail_start(&self, detail: String) -> SandboxError {
        self.state.store(SandboxState::Exited as u8, Ordering::Release);
        SandboxError::StartFailed(detail)
    }

    /// The container user is not the host user; let it write screenshots.
    async fn prepare_output_dir(&self) -> std::io::Result<()> {
        let dir = self.config.output_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777)).await
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    fn id(&self) -> &str {
        &self.config.execution_id
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn start(&mut self) -> sandbox::Result<mpsc::Receiver<OutputLine>> {
        if !self.transition(SandboxState::Created, SandboxState::Running) {
            return Err(SandboxError::StartFailed(format!(
                "sandbox {} already started",
                self.config.execution_id
            )));
        }
        if let Err(e) = self.prepare_output_dir().await {
            return Err(self.fail_start(format!("prepare output dir: {e}")));
        }

        let args = run_args(&self.docker, &self.config, &self.name);
        debug!(id = %self.config.execution_id, args = ?args, "docker run");
        let spawned = tokio::process::Command::new(&self.docker.binary)
            .args(&args)
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return Err(self.fail_start(format!("spawn docker: {e}"))),
        };

        let lines = stream_output(&mut child, OUTPUT_BUFFER);
        self.pid = child.id();
        self.child = Some(child);
        info!(
            id = %self.config.execution_id,
            container = %self.name,
            isolation = "container",
            "container started"
        );
        Ok(lines)
    }

    async fn wait(&mut self) -> sandbox::Result<ProcessExit> {
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SandboxError::NotRunning(self.config.execution_id.clone()))?;
        let status = child
            .wait()
            .await
            .map_err(|e| SandboxError::WaitFailed(e.to_string()))?;
        self.state.store(SandboxState::Exited as u8, Ordering::Release);
        Ok(exit_from_status(self.pid, status))
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        if self.state.load(Ordering::Acquire) != SandboxState::Running as u8 {
            return Ok(());
        }
        // Killing the CLI alone leaves the container running.
        exec_ignore_errors(&self.docker.binary, &["kill", &self.name]).await;
        if let Some(pid) = self.pid {
            kill_process_group(pid);
        }
        info!(id = %self.config.execution_id, container = %self.name, "container killed");
        Ok(())
    }
}
