use std::sync::Arc;

use async_trait::async_trait;
use sandbox::{IsolationLevel, Sandbox, SandboxConfig, SandboxError, SandboxFactory};
use tracing::{info, warn};

use crate::command::{exec, exec_ignore_errors};
use crate::config::DockerConfig;
use crate::sandbox::{DockerSandbox, LABEL_KEY};

pub struct DockerFactory {
    config: Arc<DockerConfig>,
}

impl DockerFactory {
    /// Probe the runtime; fails with `BackendNotAvailable` when unusable.
    pub async fn new(config: DockerConfig) -> Result<Self, SandboxError> {
        crate::prerequisites::check_prerequisites(&config).await?;
        info!(image = %config.image, "container backend ready");
        Ok(Self {
            config: Arc::new(config),
        })
    }
}

#[async_trait]
impl SandboxFactory for DockerFactory {
    fn name(&self) -> &str {
        "docker"
    }

    fn isolation(&self) -> IsolationLevel {
        IsolationLevel::Container
    }

    async fn create(&self, config: SandboxConfig) -> sandbox::Result<Box<dyn Sandbox>> {
        if !config.artifact_path().is_file() {
            return Err(SandboxError::InvalidConfig(format!(
                "artifact missing: {}",
                config.artifact_path().display()
            )));
        }
        Ok(Box::new(DockerSandbox::new(config, Arc::clone(&self.config))))
    }

    async fn destroy(&self, sandbox: Box<dyn Sandbox>) {
        let mut sandbox = match (sandbox as Box<dyn std::any::Any>).downcast::<DockerSandbox>() {
            Ok(s) => *s,
            Err(_) => {
                warn!("destroy called with non-docker sandbox, ignoring");
                return;
            }
        };
        let _ = sandbox.kill().await;
        // `--rm` normally removes it; this covers a CLI that died first.
        exec_ignore_errors(&self.config.binary, &["rm", "-f", &sandbox.name]).await;
    }

    async fn kill_by_label(&self, execution_id: &str) {
        let filter = format!("label={LABEL_KEY}={execution_id}");
        let ids = match exec(&self.config.binary, &["ps", "-q", "--filter", &filter]).await {
            Ok(out) => out,
            Err(e) => {
                warn!(id = %execution_id, error = %e.detail, "kill by label: listing containers failed");
                return;
            }
        };
        let ids: Vec<&str> = ids.split_whitespace().collect();
        if ids.is_empty() {
            return;
        }
        let mut args = vec!["kill"];
        args.extend(ids.iter().copied());
        exec_ignore_errors(&self.config.binary, &args).await;
        info!(id = %execution_id, containers = ids.len(), "killed containers by label");
    }
}
