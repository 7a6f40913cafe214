use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use engine::{EngineConfig, ScriptInfo};
use sandbox_docker::DockerConfig;
use sandbox_process::ProcessConfig;
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

pub(crate) const DEFAULT_HEARTBEAT_SECS: u64 = 30;
pub(crate) const DEFAULT_STALE_AFTER_SECS: u64 = 90;

/// Which sandbox backend to run scripts in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// Container when the runtime answers, plain process otherwise.
    #[default]
    Auto,
    Container,
    Process,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub isolation: IsolationMode,
    /// Seconds between pings to every connected channel.
    pub heartbeat_secs: u64,
    /// Channels silent for longer than this are dropped.
    pub stale_after_secs: u64,
    pub engine: EngineConfig,
    pub docker: DockerSection,
    pub process: ProcessSection,
    pub persistence: Option<PersistenceConfig>,
    /// Known scripts by id; names show up on executions.
    pub scripts: HashMap<String, ScriptInfo>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8787)),
            isolation: IsolationMode::Auto,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            stale_after_secs: DEFAULT_STALE_AFTER_SECS,
            engine: EngineConfig::default(),
            docker: DockerSection::default(),
            process: ProcessSection::default(),
            persistence: None,
            scripts: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub binary: PathBuf,
    pub image: String,
    pub user: String,
    pub command: Vec<String>,
    pub tmpfs_mb: u32,
    pub shm_mb: u32,
    pub pids_limit: u32,
    pub capabilities: Vec<String>,
    pub seccomp_profile: Option<PathBuf>,
}

impl Default for DockerSection {
    fn default() -> Self {
        let d = DockerConfig::default();
        Self {
            binary: d.binary,
            image: d.image,
            user: d.user,
            command: d.command,
            tmpfs_mb: d.tmpfs_mb,
            shm_mb: d.shm_mb,
            pids_limit: d.pids_limit,
            capabilities: d.capabilities,
            seccomp_profile: d.seccomp_profile,
        }
    }
}

impl DockerSection {
    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            binary: self.binary.clone(),
            image: self.image.clone(),
            user: self.user.clone(),
            command: self.command.clone(),
            tmpfs_mb: self.tmpfs_mb,
            shm_mb: self.shm_mb,
            pids_limit: self.pids_limit,
            capabilities: self.capabilities.clone(),
            seccomp_profile: self.seccomp_profile.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessSection {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub output_buffer: usize,
}

impl Default for ProcessSection {
    fn default() -> Self {
        let d = ProcessConfig::default();
        Self {
            program: d.program,
            args: d.args,
            env: d.env.into_iter().collect(),
            output_buffer: d.output_buffer,
        }
    }
}

impl ProcessSection {
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            program: self.program.clone(),
            args: self.args.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            output_buffer: self.output_buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Load and validate a server config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> ServerResult<ServerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ServerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl ServerConfig {
    /// Resolve relative paths against `config_dir` (the directory containing the YAML file).
    ///
    /// Bare program names like `docker` are left alone so they are looked up on `PATH`.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        let resolve_program = |p: &mut PathBuf| {
            if p.is_relative() && p.components().count() > 1 {
                *p = config_dir.join(&*p);
            }
        };
        resolve_program(&mut self.docker.binary);
        resolve_program(&mut self.process.program);
        if let Some(profile) = &mut self.docker.seccomp_profile {
            resolve(profile);
        }
        if let Some(root) = &mut self.engine.scratch_root {
            resolve(root);
        }
        if let Some(log) = &mut self.engine.quarantine_log {
            resolve(log);
        }
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.engine.max_concurrent == 0 {
            return Err(ServerError::Config(
                "engine.max_concurrent must be at least 1".into(),
            ));
        }
        if self.heartbeat_secs == 0 {
            return Err(ServerError::Config("heartbeat_secs must be positive".into()));
        }
        if self.stale_after_secs < self.heartbeat_secs {
            return Err(ServerError::Config(format!(
                "stale_after_secs ({}) must not be shorter than heartbeat_secs ({})",
                self.stale_after_secs, self.heartbeat_secs
            )));
        }
        if let Some(persistence) = &self.persistence
            && persistence.url.trim().is_empty()
        {
            return Err(ServerError::Config("persistence.url is empty".into()));
        }
        Ok(())
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = r#"
listen: 0.0.0.0:9000
isolation: container
heartbeat_secs: 10
stale_after_secs: 30
engine:
  max_concurrent: 3
  default_timeout_ms: 20000
  scratch_root: scratch
  quarantine_log: /var/log/playguard/quarantine.jsonl
docker:
  image: playwright:local
  binary: bin/docker
  seccomp_profile: seccomp.json
  pids_limit: 128
process:
  program: node
  args: ["run.js", "{artifact}"]
  env:
    NODE_PATH: /opt/pw/node_modules
persistence:
  url: https://api.example.com
  token: secret
scripts:
  login:
    name: Login check
    description: Logs in and checks the dashboard
"#;
        let config_path = dir.path().join("playguard.yaml");
        tokio::fs::write(&config_path, yaml).await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.isolation, IsolationMode::Container);
        assert_eq!(config.heartbeat(), Duration::from_secs(10));
        assert_eq!(config.engine.max_concurrent, 3);
        assert_eq!(config.engine.default_timeout_ms, 20_000);
        // Unset engine fields keep their defaults.
        assert_eq!(
            config.engine.max_timeout_ms,
            EngineConfig::default().max_timeout_ms
        );
        assert_eq!(config.engine.scratch_root, Some(dir.path().join("scratch")));
        assert_eq!(
            config.engine.quarantine_log,
            Some(PathBuf::from("/var/log/playguard/quarantine.jsonl"))
        );

        assert_eq!(config.docker.image, "playwright:local");
        assert_eq!(config.docker.binary, dir.path().join("bin/docker"));
        assert_eq!(
            config.docker.seccomp_profile,
            Some(dir.path().join("seccomp.json"))
        );
        assert_eq!(config.docker.user, DockerConfig::default().user);
        assert_eq!(config.docker.docker_config().pids_limit, 128);

        // Bare program names stay on PATH.
        assert_eq!(config.process.program, PathBuf::from("node"));
        let process = config.process.process_config();
        assert_eq!(
            process.env,
            [("NODE_PATH".to_string(), "/opt/pw/node_modules".to_string())]
        );

        let persistence = config.persistence.unwrap();
        assert_eq!(persistence.url, "https://api.example.com");
        assert_eq!(persistence.token.as_deref(), Some("secret"));
        assert_eq!(config.scripts["login"].name, "Login check");
    }

    #[tokio::test]
    async fn load_empty_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("playguard.yaml");
        tokio::fs::write(&config_path, "{}\n").await.unwrap();

        let config = load(&config_path).await.unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.listen.to_string(), "127.0.0.1:8787");
        assert_eq!(config.isolation, IsolationMode::Auto);
        assert_eq!(config.docker.binary, PathBuf::from("docker"));
        assert!(config.persistence.is_none());
    }

    #[tokio::test]
    async fn load_fails_on_missing_file() {
        let err = load(Path::new("/nonexistent/playguard.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read /nonexistent"), "got: {err}");
    }

    #[tokio::test]
    async fn load_rejects_unknown_isolation() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("playguard.yaml");
        tokio::fs::write(&config_path, "isolation: vm\n").await.unwrap();

        let err = load(&config_path).await.unwrap_err();
        assert!(err.to_string().contains("parse"), "got: {err}");
    }

    #[test]
    fn validate_rejects_inconsistent_heartbeat() {
        let config = ServerConfig {
            heartbeat_secs: 60,
            stale_after_secs: 30,
            ..ServerConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_after_secs"), "got: {err}");

        let config = ServerConfig {
            engine: EngineConfig {
                max_concurrent: 0,
                ..EngineConfig::default()
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_mirror_backend_defaults() {
        let config = ServerConfig::default();
        let docker = config.docker.docker_config();
        assert_eq!(docker.image, DockerConfig::default().image);
        assert_eq!(docker.command, DockerConfig::default().command);
        let process = config.process.process_config();
        assert_eq!(process.args, ProcessConfig::default().args);
        assert_eq!(process.program, PathBuf::from("npx"));
    }
}
