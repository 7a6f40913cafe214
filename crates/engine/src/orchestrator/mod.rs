//! Sandbox orchestration.
//!
//! [`Orchestrator::submit`] admits, screens and launches one script. Each
//! admitted execution then runs as its own tokio task (see `task.rs`) that
//! owns the sandbox handle, relays parsed output to the hub and finalizes the
//! execution exactly once.

mod artifact;
mod execution;
mod export;
mod progress;
mod protocol;
mod task;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use event_hub::{EventKind, ExecutionEvent, Hub};
use parking_lot::Mutex;
use sandbox::{IsolationLevel, ResourceLimits, SandboxConfig, SandboxFactory};
use serde::Serialize;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::collaborators::{Collaborators, MetricEvent};
use crate::config::EngineConfig;
use crate::error::{AdmissionKind, EngineError, EngineResult, ReasonCode};
use crate::quarantine::{QuarantineEntry, QuarantineRequest, QuarantineStore, Severity};
use crate::sanitizer::Sanitizer;
use crate::types::SubmitRequest;
use crate::validator::redact::redact_str;
use crate::validator::{SecretMasker, SecurityMetrics, Validator};

pub use artifact::ARTIFACT_FILE;
pub use execution::{
    Execution, ExecutionError, ExecutionStatus, LogEntry, LogLevel, MAX_LOG_ENTRIES, SecurityInfo,
};
pub use protocol::{LineTag, classify};

use task::ExecutionTask;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

/// Registry entry for a running execution.
struct Active {
    snapshot: Arc<Mutex<Execution>>,
    cancel: CancellationToken,
}

pub(crate) struct Inner {
    config: EngineConfig,
    factory: Arc<dyn SandboxFactory>,
    hub: Arc<Hub>,
    collaborators: Collaborators,
    validator: Arc<Validator>,
    sanitizer: Sanitizer,
    quarantine: QuarantineStore,
    active: Mutex<HashMap<String, Active>>,
    recent: Mutex<VecDeque<Execution>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn SandboxFactory>,
        hub: Arc<Hub>,
        collaborators: Collaborators,
    ) -> Self {
        let validator = Arc::new(Validator::new(
            config.clone(),
            collaborators.memory.clone(),
        ));
        let quarantine = QuarantineStore::new(config.quarantine_log.clone());
        if factory.isolation().is_reduced() {
            warn!(
                backend = factory.name(),
                "sandbox backend runs scripts as plain processes; isolation is reduced"
            );
        }
        Self {
            inner: Arc::new(Inner {
                config,
                factory,
                hub,
                collaborators,
                validator,
                sanitizer: Sanitizer::default(),
                quarantine,
                active: Mutex::new(HashMap::new()),
                recent: Mutex::new(VecDeque::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.factory.isolation()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    /// Admits, screens and launches a script. Returns once the sandbox is
    /// running; the outcome arrives as hub events.
    pub async fn submit(&self, request: SubmitRequest) -> EngineResult<Submitted> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(EngineError::Admission {
                kind: AdmissionKind::Capacity,
                message: "engine is shutting down".into(),
                errors: vec!["engine is shutting down".into()],
            });
        }

        let execution_id = request
            .execution_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let admission = inner
            .validator
            .admit(&execution_id, &request.code, &request.config);
        let resolved = match (admission.ok, admission.resolved) {
            (true, Some(resolved)) => resolved,
            _ => {
                let errors: Vec<String> = admission.errors.iter().map(|e| redact_str(e)).collect();
                return Err(EngineError::Admission {
                    kind: admission.rejection.unwrap_or(AdmissionKind::Invalid),
                    message: errors.join("; "),
                    errors,
                });
            }
        };
        // From here on the validation record is released on every path.
        let slot = SlotGuard {
            validator: inner.validator.clone(),
            execution_id: execution_id.clone(),
        };

        let screened = inner.sanitizer.sanitize(&request.code);
        let sanitized_code = match screened.sanitized_code.clone() {
            Some(code) if screened.is_valid => code,
            _ => {
                let errors: Vec<String> = screened.errors.iter().map(|e| redact_str(e)).collect();
                let entry = inner
                    .quarantine
                    .record(QuarantineRequest {
                        execution_id: Some(execution_id.clone()),
                        original_code: request.code.clone(),
                        sanitized_code: None,
                        reason: ReasonCode::SanitizationRejected.to_string(),
                        errors: errors.clone(),
                        severity: screened.severity().unwrap_or(Severity::Medium),
                    })
                    .await;
                inner.collaborators.metrics.record(MetricEvent::Blocked);
                return Err(EngineError::Sanitization {
                    sanitization_id: screened.sanitization_id,
                    quarantine_id: entry.id,
                    errors,
                });
            }
        };

        let script_name = inner
            .collaborators
            .catalog
            .lookup(&request.script_id)
            .await
            .map(|info| info.name);
        let mut execution = Execution::new(
            execution_id.clone(),
            request.script_id.clone(),
            script_name,
            resolved.clone(),
            SecurityInfo {
                sanitized: true,
                isolation_level: inner.factory.isolation(),
                sanitization_id: screened.sanitization_id.clone(),
            },
        );
        let notices: Vec<_> = admission
            .errors
            .iter()
            .map(|notice| execution.push_log(LogLevel::Warn, redact_str(notice)))
            .collect();

        let masker = SecretMasker::from_parameters(&request.parameters);
        let scratch = match self.prepare_scratch(&sanitized_code, &request, &execution).await {
            Ok(scratch) => scratch,
            Err(e) => return Err(inner.fail_launch(execution, e).await),
        };

        let sandbox_config = SandboxConfig {
            execution_id: execution_id.clone(),
            resources: ResourceLimits {
                memory_mb: resolved.max_memory_mb,
                cpu_percent: resolved.max_cpu_percent,
                timeout: Duration::from_millis(resolved.timeout_ms),
            },
            scratch_dir: scratch.path().to_path_buf(),
            artifact: ARTIFACT_FILE.to_string(),
            browser_engine: resolved.browser_engine.clone(),
        };
        let mut sandbox = match inner.factory.create(sandbox_config).await {
            Ok(sandbox) => sandbox,
            Err(e) => return Err(inner.fail_launch(execution, e.to_string()).await),
        };
        let lines = match sandbox.start().await {
            Ok(lines) => lines,
            Err(e) => {
                inner.factory.destroy(sandbox).await;
                return Err(inner.fail_launch(execution, e.to_string()).await);
            }
        };
        if inner.factory.isolation().is_reduced() {
            warn!(
                execution_id = %execution_id,
                "running without container isolation (reduced security)"
            );
        }

        execution.status = ExecutionStatus::Running;
        let persisted = execution.clone();
        let snapshot = Arc::new(Mutex::new(execution));
        let cancel = inner.shutdown.child_token();
        inner.active.lock().insert(
            execution_id.clone(),
            Active {
                snapshot: snapshot.clone(),
                cancel: cancel.clone(),
            },
        );
        inner.publish(
            &execution_id,
            EventKind::Status,
            json!({ "status": ExecutionStatus::Running }),
        );
        for notice in notices {
            inner.publish(&execution_id, EventKind::Log, json!(notice));
        }
        inner.collaborators.metrics.record(MetricEvent::Submitted);
        inner.collaborators.persistence.create(&persisted).await;
        info!(
            execution_id = %execution_id,
            script_id = %request.script_id,
            isolation = %inner.factory.isolation(),
            pid = ?sandbox.pid(),
            "execution started"
        );

        let finished = Arc::new(AtomicBool::new(false));
        let task = ExecutionTask {
            inner: inner.clone(),
            id: execution_id.clone(),
            snapshot: snapshot.clone(),
            sandbox: Some(sandbox),
            lines,
            cancel,
            masker,
            finished: finished.clone(),
            stderr_tail: VecDeque::new(),
            scratch: Some(scratch),
            slot,
        };
        let supervisor = Supervisor {
            inner: inner.clone(),
            id: execution_id.clone(),
            snapshot,
            finished,
            original_code: request.code,
            sanitized_code,
        };
        let handle = inner.tracker.spawn(task.run());
        inner.tracker.spawn(supervisor.watch(handle));

        Ok(Submitted {
            execution_id,
            status: ExecutionStatus::Running,
        })
    }

    async fn prepare_scratch(
        &self,
        sanitized_code: &str,
        request: &SubmitRequest,
        execution: &Execution,
    ) -> Result<TempDir, String> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("playguard-");
        let scratch = match &self.inner.config.scratch_root {
            Some(root) => {
                tokio::fs::create_dir_all(root)
                    .await
                    .map_err(|e| format!("scratch root {}: {e}", root.display()))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| format!("scratch dir: {e}"))?;

        let source = artifact::render(
            sanitized_code,
            &request.parameters,
            &execution.config,
            self.inner.factory.isolation(),
        );
        tokio::fs::write(scratch.path().join(ARTIFACT_FILE), source)
            .await
            .map_err(|e| format!("write artifact: {e}"))?;
        Ok(scratch)
    }

    /// Requests cancellation. False if the execution is not running.
    pub fn cancel(&self, execution_id: &str) -> bool {
        let token = self
            .inner
            .active
            .lock()
            .get(execution_id)
            .map(|active| active.cancel.clone());
        match token {
            Some(token) => {
                info!(execution_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get_execution(&self, execution_id: &str) -> Option<Execution> {
        let snapshot = self
            .inner
            .active
            .lock()
            .get(execution_id)
            .map(|active| active.snapshot.clone());
        if let Some(snapshot) = snapshot {
            return Some(snapshot.lock().clone());
        }
        self.inner
            .recent
            .lock()
            .iter()
            .rev()
            .find(|e| e.id == execution_id)
            .cloned()
    }

    /// Running executions first, then recently finished ones, newest first.
    pub fn get_all_executions(&self) -> Vec<Execution> {
        let snapshots: Vec<_> = self
            .inner
            .active
            .lock()
            .values()
            .map(|active| active.snapshot.clone())
            .collect();
        let mut all: Vec<Execution> = snapshots.iter().map(|s| s.lock().clone()).collect();
        all.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        all.extend(self.inner.recent.lock().iter().rev().cloned());
        all
    }

    pub fn quarantine(&self) -> Vec<QuarantineEntry> {
        self.inner.quarantine.entries()
    }

    pub fn security_metrics(&self) -> SecurityMetrics {
        self.inner.validator.security_metrics()
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }

    /// Cancels every execution and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        info!(active = self.active_count(), "orchestrator shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn publish(&self, execution_id: &str, kind: EventKind, data: Value) {
        let event = ExecutionEvent::new(kind, execution_id, data);
        self.hub.publish(execution_id, &event);
    }

    /// Records a launch failure as a failed execution and builds the error.
    async fn fail_launch(&self, mut execution: Execution, detail: String) -> EngineError {
        let message = redact_str(&detail);
        error!(execution_id = %execution.id, error = %message, "sandbox launch failed");
        execution.finish(
            ExecutionStatus::Failed,
            Some(ExecutionError {
                reason: ReasonCode::SandboxLaunch,
                message: message.clone(),
            }),
        );
        self.publish(
            &execution.id,
            EventKind::Error,
            json!({
                "status": ExecutionStatus::Failed,
                "reason": ReasonCode::SandboxLaunch,
                "message": message,
            }),
        );
        self.collaborators.metrics.record(MetricEvent::Submitted);
        self.collaborators.metrics.record(MetricEvent::Finished {
            status: ExecutionStatus::Failed,
            reason: Some(ReasonCode::SandboxLaunch),
            duration_ms: execution.duration_ms.unwrap_or(0),
        });
        self.collaborators.persistence.create(&execution).await;
        self.remember(execution);
        EngineError::SandboxLaunch(message)
    }

    /// Moves a finished execution into the bounded recent list.
    fn remember(&self, execution: Execution) {
        let mut recent = self.recent.lock();
        recent.push_back(execution);
        while recent.len() > self.config.recent_capacity.max(1) {
            recent.pop_front();
        }
    }

    /// Terminal transition. The first caller wins; later calls return false.
    async fn finish(
        &self,
        execution_id: &str,
        snapshot: &Mutex<Execution>,
        finished: &AtomicBool,
        status: ExecutionStatus,
        error: Option<ExecutionError>,
    ) -> bool {
        if finished.swap(true, Ordering::AcqRel) {
            return false;
        }
        let (execution, progress_reached) = {
            let mut execution = snapshot.lock();
            let before = execution.progress;
            execution.finish(status, error.clone());
            let reached = (execution.progress > before).then_some(execution.progress);
            (execution.clone(), reached)
        };

        self.active.lock().remove(execution_id);
        self.remember(execution.clone());

        if let Some(progress) = progress_reached {
            self.publish(execution_id, EventKind::Progress, json!({ "progress": progress }));
        }
        self.publish(execution_id, EventKind::Status, json!({ "status": status }));
        let (kind, data) = match status {
            ExecutionStatus::Completed => (
                EventKind::Complete,
                json!({
                    "status": status,
                    "result": execution.result,
                    "durationMs": execution.duration_ms,
                }),
            ),
            ExecutionStatus::Cancelled => (
                EventKind::Cancelled,
                json!({ "status": status, "durationMs": execution.duration_ms }),
            ),
            _ => (
                EventKind::Error,
                json!({
                    "status": status,
                    "reason": error.as_ref().map(|e| e.reason),
                    "message": error.as_ref().map(|e| e.message.as_str()),
                    "durationMs": execution.duration_ms,
                }),
            ),
        };
        self.publish(execution_id, kind, data);

        self.collaborators.metrics.record(MetricEvent::Finished {
            status,
            reason: error.as_ref().map(|e| e.reason),
            duration_ms: execution.duration_ms.unwrap_or(0),
        });
        self.collaborators.persistence.update(&execution).await;
        info!(
            execution_id,
            status = %status,
            duration_ms = execution.duration_ms.unwrap_or(0),
            reason = ?error.as_ref().map(|e| e.reason),
            "execution finished"
        );
        true
    }
}

/// Releases the validation record when dropped, including on panic.
struct SlotGuard {
    validator: Arc<Validator>,
    execution_id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.validator.finalize(&self.execution_id, "released");
    }
}

/// Finalizes an execution whose task panicked.
struct Supervisor {
    inner: Arc<Inner>,
    id: String,
    snapshot: Arc<Mutex<Execution>>,
    finished: Arc<AtomicBool>,
    original_code: String,
    sanitized_code: String,
}

impl Supervisor {
    async fn watch(self, handle: tokio::task::JoinHandle<()>) {
        let Err(e) = handle.await else {
            return;
        };
        if !e.is_panic() {
            return;
        }
        error!(execution_id = %self.id, "execution task panicked");
        self.inner.factory.kill_by_label(&self.id).await;
        self.inner
            .quarantine
            .record(QuarantineRequest {
                execution_id: Some(self.id.clone()),
                original_code: self.original_code,
                sanitized_code: Some(self.sanitized_code),
                reason: ReasonCode::HostFault.to_string(),
                errors: vec!["execution task panicked".into()],
                severity: Severity::High,
            })
            .await;
        self.inner
            .finish(
                &self.id,
                &self.snapshot,
                &self.finished,
                ExecutionStatus::Failed,
                Some(ExecutionError {
                    reason: ReasonCode::HostFault,
                    message: "internal error while running the script".into(),
                }),
            )
            .await;
    }
}
