//! Picks the sandbox backend at startup.

use std::sync::Arc;

use sandbox::{SandboxError, SandboxFactory};
use sandbox_docker::DockerFactory;
use sandbox_process::ProcessFactory;
use tracing::{info, warn};

use crate::config::{IsolationMode, ServerConfig};
use crate::error::ServerResult;

/// Build the factory the config asks for.
///
/// `auto` probes the container runtime and falls back to plain processes
/// when it is unusable; `container` treats an unusable runtime as fatal.
pub async fn select(config: &ServerConfig) -> ServerResult<Arc<dyn SandboxFactory>> {
    match config.isolation {
        IsolationMode::Container => Ok(Arc::new(docker(config).await?)),
        IsolationMode::Process => Ok(Arc::new(process(config)?)),
        IsolationMode::Auto => match docker(config).await {
            Ok(factory) => Ok(Arc::new(factory)),
            Err(e) => {
                warn!(error = %e, "container runtime unavailable, falling back to direct processes");
                Ok(Arc::new(process(config)?))
            }
        },
    }
}

async fn docker(config: &ServerConfig) -> Result<DockerFactory, SandboxError> {
    DockerFactory::new(config.docker.docker_config()).await
}

fn process(config: &ServerConfig) -> Result<ProcessFactory, SandboxError> {
    let factory = ProcessFactory::new(config.process.process_config())?;
    info!(program = %config.process.program.display(), "process backend ready");
    Ok(factory)
}
