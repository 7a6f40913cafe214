use std::path::PathBuf;
use std::time::Duration;

/// Per-sandbox ceilings, already clamped by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    /// Share of one CPU, 1..=100.
    pub cpu_percent: u32,
    pub timeout: Duration,
}

pub struct SandboxConfig {
    /// Execution id. Backends tag whatever they launch with it so that
    /// `SandboxFactory::kill_by_label` can find orphans.
    pub execution_id: String,
    pub resources: ResourceLimits,
    /// Per-execution scratch directory; owned and deleted by the caller.
    pub scratch_dir: PathBuf,
    /// File name of the test artifact inside `scratch_dir`.
    pub artifact: String,
    pub browser_engine: String,
}

impl SandboxConfig {
    pub fn artifact_path(&self) -> PathBuf {
        self.scratch_dir.join(&self.artifact)
    }

    /// Writable output directory inside the scratch dir (screenshots, reports).
    pub fn output_dir(&self) -> PathBuf {
        self.scratch_dir.join("out")
    }
}
