//! Append-only store of rejected or misbehaving scripts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub original_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sanitized_code: Option<String>,
    pub reason: String,
    pub errors: Vec<String>,
    pub severity: Severity,
    pub code_sha256: String,
    pub created_at: DateTime<Utc>,
}

/// What the caller knows when quarantining; the store fills in the rest.
#[derive(Debug, Clone)]
pub struct QuarantineRequest {
    pub execution_id: Option<String>,
    pub original_code: String,
    pub sanitized_code: Option<String>,
    pub reason: String,
    pub errors: Vec<String>,
    pub severity: Severity,
}

pub struct QuarantineStore {
    entries: Mutex<Vec<QuarantineEntry>>,
    log_path: Option<PathBuf>,
}

impl QuarantineStore {
    /// `log_path`, when set, receives one JSON line per entry.
    pub fn new(log_path: Option<PathBuf>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            log_path,
        }
    }

    /// Stores an entry and returns it. A failing audit file only warns.
    pub async fn record(&self, request: QuarantineRequest) -> QuarantineEntry {
        let entry = QuarantineEntry {
            id: uuid::Uuid::new_v4().to_string(),
            code_sha256: sha256_hex(&request.original_code),
            execution_id: request.execution_id,
            original_code: request.original_code,
            sanitized_code: request.sanitized_code,
            reason: request.reason,
            errors: request.errors,
            severity: request.severity,
            created_at: Utc::now(),
        };
        self.entries.lock().push(entry.clone());
        info!(
            quarantine_id = %entry.id,
            execution_id = entry.execution_id.as_deref().unwrap_or("-"),
            severity = ?entry.severity,
            reason = %entry.reason,
            "script quarantined"
        );

        if let Some(path) = &self.log_path
            && let Err(e) = append_line(path, &entry).await
        {
            warn!(path = %path.display(), error = %e, "failed to write quarantine log");
        }
        entry
    }

    pub fn entries(&self) -> Vec<QuarantineEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

async fn append_line(path: &Path, entry: &QuarantineEntry) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    file.flush().await
}

fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
