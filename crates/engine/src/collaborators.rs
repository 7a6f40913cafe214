//! Seams to the outside world: script catalog, persistence and metrics.
//!
//! The engine only ever talks to these traits. Default implementations keep
//! everything in memory; [`HttpPersistence`] mirrors snapshots to a REST API.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ReasonCode;
use crate::orchestrator::{Execution, ExecutionStatus};
use crate::validator::{MemoryProbe, SysinfoProbe};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Script catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[async_trait]
pub trait ScriptCatalog: Send + Sync {
    async fn lookup(&self, script_id: &str) -> Option<ScriptInfo>;
}

/// Catalog backed by a fixed map, usually loaded from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    scripts: HashMap<String, ScriptInfo>,
}

impl StaticCatalog {
    pub fn new(scripts: HashMap<String, ScriptInfo>) -> Self {
        Self { scripts }
    }
}

#[async_trait]
impl ScriptCatalog for StaticCatalog {
    async fn lookup(&self, script_id: &str) -> Option<ScriptInfo> {
        self.scripts.get(script_id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Receives execution snapshots. Implementations must not fail the
/// execution; errors are logged and dropped.
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    async fn create(&self, execution: &Execution);
    async fn update(&self, execution: &Execution);
}

pub struct NoopPersistence;

#[async_trait]
impl PersistenceSink for NoopPersistence {
    async fn create(&self, _execution: &Execution) {}
    async fn update(&self, _execution: &Execution) {}
}

/// `POST {base}/executions` on create, `PUT {base}/executions/{id}` on
/// update, JSON bodies, optional bearer token.
#[derive(Clone)]
pub struct HttpPersistence {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpPersistence {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    async fn send(&self, method: Method, path: String, execution: &Execution) {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.request(method.clone(), &url).json(execution);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(execution_id = %execution.id, %method, "execution persisted");
            }
            Ok(response) => {
                warn!(
                    execution_id = %execution.id,
                    %method,
                    status = %response.status(),
                    "persistence rejected execution snapshot"
                );
            }
            Err(e) => {
                warn!(execution_id = %execution.id, %method, error = %e, "persistence request failed");
            }
        }
    }
}

#[async_trait]
impl PersistenceSink for HttpPersistence {
    async fn create(&self, execution: &Execution) {
        self.send(Method::POST, "/executions".to_string(), execution)
            .await;
    }

    async fn update(&self, execution: &Execution) {
        let path = format!("/executions/{}", execution.id);
        self.send(Method::PUT, path, execution).await;
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricEvent {
    /// A submission passed admission and sanitization.
    Submitted,
    /// A submission was quarantined by the sanitizer.
    Blocked,
    Finished {
        status: ExecutionStatus,
        reason: Option<ReasonCode>,
        duration_ms: u64,
    },
}

pub trait MetricsSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total: u64,
    pub blocked: u64,
    pub timeouts: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub average_duration_ms: f64,
}

/// In-memory aggregate counters.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total: AtomicU64,
    blocked: AtomicU64,
    timeouts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    finished: AtomicU64,
    duration_ms_sum: AtomicU64,
}

impl EngineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.finished.load(Ordering::Relaxed);
        let sum = self.duration_ms_sum.load(Ordering::Relaxed);
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            average_duration_ms: if finished == 0 {
                0.0
            } else {
                sum as f64 / finished as f64
            },
        }
    }
}

impl MetricsSink for EngineMetrics {
    fn record(&self, event: MetricEvent) {
        match event {
            MetricEvent::Submitted => {
                self.total.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Blocked => {
                self.total.fetch_add(1, Ordering::Relaxed);
                self.blocked.fetch_add(1, Ordering::Relaxed);
            }
            MetricEvent::Finished {
                status,
                reason,
                duration_ms,
            } => {
                let counter = match status {
                    ExecutionStatus::Completed => &self.completed,
                    ExecutionStatus::Cancelled => &self.cancelled,
                    _ => &self.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                if reason == Some(ReasonCode::Timeout) {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.finished.fetch_add(1, Ordering::Relaxed);
                self.duration_ms_sum
                    .fetch_add(duration_ms, Ordering::Relaxed);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bundle
// ---------------------------------------------------------------------------

/// Everything the orchestrator needs from outside the engine.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn ScriptCatalog>,
    pub persistence: Arc<dyn PersistenceSink>,
    pub metrics: Arc<dyn MetricsSink>,
    pub memory: Arc<dyn MemoryProbe>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            catalog: Arc::new(StaticCatalog::default()),
            persistence: Arc::new(NoopPersistence),
            metrics: Arc::new(EngineMetrics::default()),
            memory: Arc::new(SysinfoProbe::new()),
        }
    }
}
