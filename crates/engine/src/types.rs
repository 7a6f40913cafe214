use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-supplied run settings; anything unset takes the engine default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunConfig {
    pub timeout_ms: Option<u64>,
    pub headless: Option<bool>,
    pub browser_engine: Option<String>,
    pub capture_screenshots: Option<bool>,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: Option<u32>,
    pub max_cpu_percent: Option<u32>,
}

/// Run settings after clamping; recorded on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    pub timeout_ms: u64,
    pub headless: bool,
    pub browser_engine: String,
    pub capture_screenshots: bool,
    #[serde(rename = "maxMemoryMB")]
    pub max_memory_mb: u32,
    pub max_cpu_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub script_id: String,
    pub code: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub config: RunConfig,
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub execution_id: Option<String>,
}

impl SubmitRequest {
    pub fn new(script_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            script_id: script_id.into(),
            code: code.into(),
            parameters: Map::new(),
            config: RunConfig::default(),
            execution_id: None,
        }
    }
}
