use std::path::PathBuf;

/// Settings for the container backend.
///
/// `command` may contain the placeholders `{artifact}`, `{output}` and
/// `{browser}`; paths are substituted with their in-container locations.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub binary: PathBuf,
    pub image: String,
    /// Non-root user the script runs as inside the container.
    pub user: String,
    pub command: Vec<String>,
    /// Size of the writable `/tmp` tmpfs.
    pub tmpfs_mb: u32,
    /// Size of `/dev/shm`; Chromium needs more than Docker's 64 MiB default.
    pub shm_mb: u32,
    pub pids_limit: u32,
    /// Capabilities re-added after `--cap-drop ALL`.
    pub capabilities: Vec<String>,
    pub seccomp_profile: Option<PathBuf>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            image: "mcr.microsoft.com/playwright:v1.47.0-jammy".into(),
            user: "pwuser".into(),
            command: vec![
                "npx".into(),
                "playwright".into(),
                "test".into(),
                "{artifact}".into(),
                "--reporter=line".into(),
                "--workers=1".into(),
                "--output={output}".into(),
            ],
            tmpfs_mb: 256,
            shm_mb: 256,
            pids_limit: 512,
            capabilities: Vec::new(),
            seccomp_profile: None,
        }
    }
}
