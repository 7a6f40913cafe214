use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox::process::kill_process_group;
use sandbox::{IsolationLevel, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::sandbox::{PidRegistry, ProcessSandbox};

pub struct ProcessFactory {
    config: Arc<ProcessConfig>,
    registry: PidRegistry,
}

impl ProcessFactory {
    /// Verify the launch program resolves before accepting work.
    pub fn new(config: ProcessConfig) -> Result<Self, SandboxError> {
        check_program(&config.program)?;
        warn!(
            program = %config.program.display(),
            "direct-process backend selected: scripts run WITHOUT container isolation"
        );
        Ok(Self {
            config: Arc::new(config),
            registry: PidRegistry::default(),
        })
    }
}

fn check_program(program: &Path) -> Result<(), SandboxError> {
    let found = if program.components().count() > 1 {
        program.is_file()
    } else {
        which::which(program).is_ok()
    };
    if found {
        Ok(())
    } else {
        Err(SandboxError::BackendNotAvailable(format!(
            "launch program not found: {}",
            program.display()
        )))
    }
}

#[async_trait]
impl SandboxFactory for ProcessFactory {
    fn name(&self) -> &str {
        "process"
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Process
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if !config.scratch_dir.is_dir() {
            return Err(SandboxError::InvalidConfig(format!(
                "scratch dir missing: {}",
                config.scratch_dir.display()
            )));
        }
        debug!(id = %config.execution_id, "process sandbox created");
        Ok(Box::new(ProcessSandbox::new(
            config,
            Arc::clone(&self.config),
            Arc::clone(&self.registry),
        )))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<ProcessSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                warn!("destroy called with non-process sandbox, ignoring");
                return;
            }
        };
        let _ = sandbox.kill().await;
        debug!(id = %sandbox.id(), "process sandbox destroyed");
    }

    async fn kill_by_label(&self, execution_id: &str) {
        let pid = self.registry.lock().remove(execution_id);
        if let Some(pid) = pid {
            kill_process_group(pid);
            info!(id = %execution_id, pid, "killed sandbox by label");
        }
    }
}
