use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::sandbox::Sandbox;

/// How strongly a backend separates the script from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Container with no network, read-only root and dropped capabilities.
    Container,
    /// Plain child process. Reduced security: no filesystem, network or
    /// capability restrictions.
    Process,
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Process => "process",
        }
    }

    pub fn is_reduced(self) -> bool {
        matches!(self, Self::Process)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait SandboxFactory: Send + Sync {
    /// Human-readable name for this factory implementation (e.g. "docker").
    fn name(&self) -> &str;
    fn isolation(&self) -> IsolationLevel;
    /// Create a sandbox for one execution. Nothing runs until `Sandbox::start`.
    async fn create(&self, config: SandboxConfig) -> Result<Box<dyn Sandbox>>;
    /// Kill (if still alive) and release everything the sandbox holds.
    async fn destroy(&self, sandbox: Box<dyn Sandbox>);
    /// Best-effort kill of anything this backend launched for `execution_id`,
    /// including sandboxes whose handle has already been dropped.
    async fn kill_by_label(&self, execution_id: &str);
}
