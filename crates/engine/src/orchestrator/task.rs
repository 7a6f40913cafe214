use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use event_hub::EventKind;
use parking_lot::Mutex;
use sandbox::{OutputLine, OutputStream, ProcessExit, Sandbox};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::execution::{Execution, ExecutionError, ExecutionStatus, LogLevel};
use super::protocol::{LineTag, classify};
use super::{Inner, SlotGuard, export, progress};
use crate::error::{ReasonCode, ViolationKind};
use crate::validator::SecretMasker;
use crate::validator::redact::redact_str;

/// stderr lines kept for the failure message of a crashed run.
const STDERR_TAIL_LINES: usize = 20;
/// How long to keep reading output after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

struct Outcome {
    status: ExecutionStatus,
    error: Option<ExecutionError>,
}

impl Outcome {
    fn completed() -> Self {
        Self {
            status: ExecutionStatus::Completed,
            error: None,
        }
    }

    fn cancelled() -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            error: Some(ExecutionError {
                reason: ReasonCode::Cancelled,
                message: "execution cancelled".into(),
            }),
        }
    }

    fn failed(reason: ReasonCode, message: String) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            error: Some(ExecutionError { reason, message }),
        }
    }
}

/// Drives one execution from a started sandbox to its terminal state.
pub(super) struct ExecutionTask {
    pub(super) inner: Arc<Inner>,
    pub(super) id: String,
    pub(super) snapshot: Arc<Mutex<Execution>>,
    pub(super) sandbox: Option<Box<dyn Sandbox>>,
    pub(super) lines: mpsc::Receiver<OutputLine>,
    pub(super) cancel: CancellationToken,
    pub(super) masker: SecretMasker,
    pub(super) finished: Arc<AtomicBool>,
    pub(super) stderr_tail: VecDeque<String>,
    pub(super) scratch: Option<TempDir>,
    pub(super) slot: SlotGuard,
}

impl ExecutionTask {
    pub(super) async fn run(mut self) {
        let Some(mut sandbox) = self.sandbox.take() else {
            return;
        };
        let outcome = self.supervise(sandbox.as_mut()).await;

        self.inner.factory.destroy(sandbox).await;
        if let Some(scratch) = self.scratch.take()
            && let Err(e) = scratch.close()
        {
            warn!(execution_id = %self.id, error = %e, "failed to remove scratch dir");
        }

        let Self {
            inner,
            id,
            snapshot,
            finished,
            slot,
            ..
        } = self;
        // Free the concurrency slot before observers learn the outcome.
        drop(slot);
        inner
            .finish(&id, &snapshot, &finished, outcome.status, outcome.error)
            .await;
    }

    async fn supervise(&mut self, sandbox: &mut dyn Sandbox) -> Outcome {
        let interval = self.inner.validator.monitor_interval();
        let mut monitor = tokio::time::interval_at(Instant::now() + interval, interval);
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timeout_ms = self.snapshot.lock().config.timeout_ms;
        let budget = Duration::from_millis(timeout_ms).min(self.inner.config.absolute_timeout());
        let deadline = tokio::time::sleep(budget);
        tokio::pin!(deadline);

        let mut lines_open = true;
        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.kill(sandbox).await;
                    self.inner.factory.kill_by_label(&self.id).await;
                    return Outcome::cancelled();
                }

                () = &mut deadline => {
                    self.kill(sandbox).await;
                    let message = format!("execution exceeded its {}ms timeout", budget.as_millis());
                    self.inner.validator.force_terminate(&self.id, &message);
                    return Outcome::failed(ViolationKind::Timeout.reason_code(), message);
                }

                _ = monitor.tick() => {
                    let child_mb = if self.inner.factory.isolation().is_reduced() {
                        sandbox
                            .pid()
                            .and_then(|pid| self.inner.collaborators.memory.child_resident_mb(pid))
                    } else {
                        None
                    };
                    let report = self.inner.validator.monitor(&self.id, child_mb);
                    if let Some(kind) = report.violation {
                        self.kill(sandbox).await;
                        let message = redact_str(&report.errors.join("; "));
                        self.inner.validator.force_terminate(&self.id, &message);
                        return Outcome::failed(kind.reason_code(), message);
                    }
                }

                line = self.lines.recv(), if lines_open => match line {
                    Some(line) => self.handle_line(line),
                    None => lines_open = false,
                },

                exit = sandbox.wait() => {
                    if lines_open {
                        self.drain().await;
                    }
                    return self.exit_outcome(exit);
                }
            }
        }
    }

    async fn kill(&self, sandbox: &mut dyn Sandbox) {
        if let Err(e) = sandbox.kill().await {
            warn!(execution_id = %self.id, error = %e, "sandbox kill failed");
        }
    }

    /// Reads what the process printed before exiting.
    async fn drain(&mut self) {
        let grace = tokio::time::sleep(DRAIN_GRACE);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                line = self.lines.recv() => match line {
                    Some(line) => self.handle_line(line),
                    None => return,
                },
                () = &mut grace => {
                    debug!(execution_id = %self.id, "output still open after exit; giving up");
                    return;
                }
            }
        }
    }

    fn exit_outcome(&self, exit: sandbox::Result<ProcessExit>) -> Outcome {
        match exit {
            Ok(exit) if exit.success() => Outcome::completed(),
            Ok(exit) => {
                let mut message = format!("sandbox exited with code {}", exit.exit_code);
                if !self.stderr_tail.is_empty() {
                    message.push_str(": ");
                    let tail: Vec<&str> = self.stderr_tail.iter().map(String::as_str).collect();
                    message.push_str(&tail.join("\n"));
                }
                Outcome::failed(ReasonCode::SandboxRuntime, message)
            }
            Err(e) => Outcome::failed(ReasonCode::SandboxRuntime, self.scrub(&e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Output handling
    // -----------------------------------------------------------------------

    fn handle_line(&mut self, line: OutputLine) {
        if line.stream == OutputStream::Stderr {
            let text = self.scrub(&line.text);
            debug!(execution_id = %self.id, line = %text, "sandbox stderr");
            if self.stderr_tail.len() >= STDERR_TAIL_LINES {
                self.stderr_tail.pop_front();
            }
            self.stderr_tail.push_back(text);
            return;
        }

        match classify(&line.text) {
            LineTag::Log { level, message } => self.log(level, message),
            LineTag::Screenshot(file) => self.screenshot(file),
            LineTag::Export(payload) => self.export(payload),
            LineTag::Plain(text) => {
                debug!(execution_id = %self.id, line = %self.scrub(text), "sandbox output");
            }
            LineTag::Empty => {}
        }
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        let message = self.scrub(message);
        let (entry, reached) = {
            let mut execution = self.snapshot.lock();
            let entry = execution.push_log(level, message);
            let reached = progress::milestone(&entry.message)
                .and_then(|value| execution.advance_progress(value));
            (entry, reached)
        };
        self.publish(EventKind::Log, json!(entry));
        if let Some(value) = reached {
            self.publish(EventKind::Progress, json!({ "progress": value }));
        }
    }

    fn screenshot(&mut self, file: &str) {
        let file = self.scrub(file);
        {
            let mut execution = self.snapshot.lock();
            if !execution.config.capture_screenshots {
                return;
            }
            execution.screenshots.push(file.clone());
        }
        self.publish(EventKind::Screenshot, json!({ "filename": file }));
    }

    fn export(&mut self, payload: &str) {
        let parsed = export::parse(payload).map(|map| {
            let mut value = Value::Object(map);
            self.masker.mask_value(&mut value);
            value
        });
        let merged = parsed.and_then(|value| {
            let Value::Object(map) = value else {
                return Ok(None);
            };
            let mut execution = self.snapshot.lock();
            export::merge(&mut execution.result, map)?;
            Ok(Some(execution.result.clone()))
        });
        match merged {
            Ok(Some(result)) => self.publish(EventKind::ResultUpdate, json!({ "result": result })),
            Ok(None) => {}
            Err(e) => {
                info!(execution_id = %self.id, error = %e, "export rejected");
                self.log(LogLevel::Error, &e.to_string());
            }
        }
    }

    fn scrub(&self, text: &str) -> String {
        redact_str(&self.masker.mask_str(text))
    }

    fn publish(&self, kind: EventKind, data: Value) {
        self.inner.publish(&self.id, kind, data);
    }
}
