use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 5;
pub(crate) const MIN_TIMEOUT_MS: u64 = 1_000;
pub(crate) const MIN_MEMORY_MB: u32 = 64;
pub(crate) const MIN_CPU_PERCENT: u32 = 1;
pub(crate) const SUPPORTED_ENGINES: [&str; 3] = ["chromium", "firefox", "webkit"];
pub(crate) const DEFAULT_ENGINE: &str = "chromium";

/// System-wide limits. Per-run settings are clamped into these ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_concurrent: usize,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    /// Hard ceiling independent of any per-run timeout.
    pub absolute_timeout_ms: u64,
    pub default_memory_mb: u32,
    pub max_memory_mb: u32,
    pub default_cpu_percent: u32,
    pub max_cpu_percent: u32,
    /// Admission stops while the engine's own RSS is at or above this.
    pub host_memory_ceiling_mb: u64,
    pub monitor_interval_ms: u64,
    /// Finished executions kept for snapshot queries.
    pub recent_capacity: usize,
    /// Parent directory for per-execution scratch dirs (system temp if unset).
    pub scratch_root: Option<PathBuf>,
    /// Append-only JSONL mirror of the quarantine.
    pub quarantine_log: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout_ms: 30_000,
            max_timeout_ms: 300_000,
            absolute_timeout_ms: 600_000,
            default_memory_mb: 1_024,
            max_memory_mb: 1_024,
            default_cpu_percent: 50,
            max_cpu_percent: 100,
            host_memory_ceiling_mb: 2_048,
            monitor_interval_ms: 5_000,
            recent_capacity: 100,
            scratch_root: None,
            quarantine_log: None,
        }
    }
}

impl EngineConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(10))
    }

    pub fn absolute_timeout(&self) -> Duration {
        Duration::from_millis(self.absolute_timeout_ms.max(MIN_TIMEOUT_MS))
    }
}
