use std::path::Path;

use sandbox::SandboxError;
use tracing::{info, warn};

use crate::command::exec;
use crate::config::DockerConfig;

/// Probe the container runtime before the factory accepts work.
///
/// Checks the CLI binary and daemon reachability, collecting failures into a
/// single `BackendNotAvailable` error. A missing image only warns: the daemon
/// pulls it on first launch.
pub async fn check_prerequisites(config: &DockerConfig) -> Result<(), SandboxError> {
    let mut errors = Vec::new();

    check_binary(&config.binary, &mut errors);
    if errors.is_empty() {
        check_daemon(&config.binary, &mut errors).await;
    }
    if let Some(profile) = &config.seccomp_profile
        && !profile.is_file()
    {
        errors.push(format!("seccomp profile not found: {}", profile.display()));
    }

    if !errors.is_empty() {
        return Err(SandboxError::BackendNotAvailable(errors.join("; ")));
    }

    check_image(config).await;
    Ok(())
}

fn check_binary(binary: &Path, errors: &mut Vec<String>) {
    let found = if binary.components().count() > 1 {
        binary.is_file()
    } else {
        which::which(binary).is_ok()
    };
    if !found {
        errors.push(format!("container CLI not found: {}", binary.display()));
    }
}

async fn check_daemon(binary: &Path, errors: &mut Vec<String>) {
    match exec(binary, &["info", "--format", "{{.ServerVersion}}"]).await {
        Ok(version) => info!(version = %version, "container runtime reachable"),
        Err(e) => errors.push(format!("container daemon not reachable: {}", e.detail)),
    }
}

async fn check_image(config: &DockerConfig) {
    if exec(&config.binary, &["image", "inspect", "--format", "{{.Id}}", &config.image])
        .await
        .is_err()
    {
        warn!(image = %config.image, "sandbox image not present locally; first launch will pull it");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let config = DockerConfig {
            binary: PathBuf::from("/nonexistent/bin/docker"),
            ..DockerConfig::default()
        };
        let err = check_prerequisites(&config).await.unwrap_err();
        match err {
            SandboxError::BackendNotAvailable(msg) => {
                assert!(msg.contains("container CLI not found"), "msg: {msg}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failing_daemon_is_reported() {
        // `false` exists but fails every invocation, like a CLI without a daemon.
        let config = DockerConfig {
            binary: PathBuf::from("false"),
            ..DockerConfig::default()
        };
        let err = check_prerequisites(&config).await.unwrap_err();
        assert!(err.to_string().contains("daemon not reachable"), "err: {err}");
    }
}
