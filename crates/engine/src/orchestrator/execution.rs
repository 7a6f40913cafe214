use std::fmt;

use chrono::{DateTime, Utc};
use sandbox::IsolationLevel;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ReasonCode;
use crate::types::ResolvedConfig;

/// Retained log entries per execution; later entries are counted, not kept.
pub const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parses the level of a `[LOG:<LEVEL>]` tag; unknown levels are `info`.
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" | "fatal" => Self::Error,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub reason: ReasonCode,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityInfo {
    pub sanitized: bool,
    pub isolation_level: IsolationLevel,
    pub sanitization_id: String,
}

/// Snapshot of one execution. Only the execution's own task mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub script_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_name: Option<String>,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub progress: u8,
    pub logs: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped_logs: u64,
    pub screenshots: Vec<String>,
    pub result: Map<String, Value>,
    pub error: Option<ExecutionError>,
    pub config: ResolvedConfig,
    pub security: SecurityInfo,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Execution {
    pub fn new(
        id: String,
        script_id: String,
        script_name: Option<String>,
        config: ResolvedConfig,
        security: SecurityInfo,
    ) -> Self {
        Self {
            id,
            script_id,
            script_name,
            status: ExecutionStatus::Queued,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            progress: 0,
            logs: Vec::new(),
            dropped_logs: 0,
            screenshots: Vec::new(),
            result: Map::new(),
            error: None,
            config,
            security,
        }
    }

    pub fn push_log(&mut self, level: LogLevel, message: String) -> LogEntry {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        if self.logs.len() < MAX_LOG_ENTRIES {
            self.logs.push(entry.clone());
        } else {
            self.dropped_logs += 1;
        }
        entry
    }

    /// Raises progress to `value`; returns the new value if it increased.
    pub fn advance_progress(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        if value > self.progress {
            self.progress = value;
            Some(value)
        } else {
            None
        }
    }

    /// Moves to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<ExecutionError>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let end = Utc::now();
        self.status = status;
        self.end_time = Some(end);
        self.duration_ms = u64::try_from((end - self.start_time).num_milliseconds()).ok();
        self.error = error;
        if status == ExecutionStatus::Completed {
            self.progress = 100;
        }
        true
    }
}
