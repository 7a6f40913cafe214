use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use async_trait::async_trait;
use sandbox::process::{exit_from_status, kill_process_group, stream_output};
use sandbox::{OutputLine, ProcessExit, Sandbox, SandboxConfig, SandboxError};
use tokio::process::Child;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::ProcessConfig;

/// Execution id -> process group id of every running fallback sandbox.
pub(crate) type PidRegistry = Arc<parking_lot::Mutex<HashMap<String, u32>>>;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SandboxState {
    Created = 0,
    Running = 1,
    Exited = 2,
}

pub struct ProcessSandbox {
    config: SandboxConfig,
    process_config: Arc<ProcessConfig>,
    child: Option<Child>,
    pid: Option<u32>,
    state: AtomicU8,
    registry: PidRegistry,
}

impl ProcessSandbox {
    pub(crate) fn new(
        config: SandboxConfig,
        process_config: Arc<ProcessConfig>,
        registry: PidRegistry,
    ) -> Self {
        Self {
            config,
            process_config,
            child: None,
            pid: None,
            state: AtomicU8::new(SandboxState::Created as u8),
            registry,
        }
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == SandboxState::Running as u8
    }

    fn transition(&self, from: SandboxState, to: SandboxState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn forget(&self) {
        let mut registry = self.registry.lock();
        if self.pid.is_some() && registry.get(&self.config.execution_id) == self.pid.as_ref() {
            registry.remove(&self.config.execution_id);
        }
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
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

        let output_dir = self.config.output_dir();
        if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
            self.state.store(SandboxState::Exited as u8, Ordering::Release);
            return Err(SandboxError::StartFailed(format!(
                "mkdir {}: {e}",
                output_dir.display()
            )));
        }

        let program = &self.process_config.program;
        let spawned = tokio::process::Command::new(program)
            .args(self.process_config.render_args(&self.config))
            .envs(self.process_config.env.iter().map(|(k, v)| (k, v)))
            .env("PLAYGUARD_EXECUTION_ID", &self.config.execution_id)
            .current_dir(&self.config.scratch_dir)
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                self.state.store(SandboxState::Exited as u8, Ordering::Release);
                return Err(SandboxError::StartFailed(format!(
                    "spawn {}: {e}",
                    program.display()
                )));
            }
        };

        let lines = stream_output(&mut child, self.process_config.output_buffer);
        self.pid = child.id();
        if let Some(pid) = self.pid {
            self.registry
                .lock()
                .insert(self.config.execution_id.clone(), pid);
        }
        self.child = Some(child);

        warn!(
            id = %self.config.execution_id,
            pid = ?self.pid,
            isolation = "process",
            "script started without container isolation (reduced security)"
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
        self.forget();
        Ok(exit_from_status(self.pid, status))
    }

    async fn kill(&mut self) -> sandbox::Result<()> {
        // Once reaped the pgid may be recycled; only signal a live group.
        if self.is_running()
            && let Some(pid) = self.pid
        {
            kill_process_group(pid);
            info!(id = %self.config.execution_id, pid, "process group killed");
        }
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        Ok(())
    }
}
