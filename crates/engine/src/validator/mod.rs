//! Admission control and runtime limit checks.
//!
//! The validator owns one [`ValidationRecord`] per admitted execution. The
//! admission check and the record insertion happen under a single lock, so
//! the active count can never overshoot `max_concurrent`.

mod masker;
pub mod redact;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, System};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{
    DEFAULT_ENGINE, EngineConfig, MIN_CPU_PERCENT, MIN_MEMORY_MB, MIN_TIMEOUT_MS,
    SUPPORTED_ENGINES,
};
use crate::error::{AdmissionKind, ViolationKind};
use crate::types::{ResolvedConfig, RunConfig};

pub use masker::SecretMasker;

/// Resident memory samples, in MiB.
pub trait MemoryProbe: Send + Sync {
    /// The engine's own process.
    fn resident_mb(&self) -> Option<u64>;
    /// A sandboxed child process.
    fn child_resident_mb(&self, pid: u32) -> Option<u64>;
}

/// [`MemoryProbe`] backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn sample(&self, pid: Pid) -> Option<u64> {
        let mut system = self.system.lock();
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory() / 1024 / 1024)
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn resident_mb(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        self.sample(pid)
    }

    fn child_resident_mb(&self, pid: u32) -> Option<u64> {
        self.sample(Pid::from_u32(pid))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ValidationRecord {
    pub start_time: Instant,
    pub config: ResolvedConfig,
    pub resource_usage: ResourceUsage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub ok: bool,
    /// Rejection reasons, or notices (like an engine substitution) on success.
    pub errors: Vec<String>,
    pub resolved: Option<ResolvedConfig>,
    pub rejection: Option<AdmissionKind>,
}

impl Admission {
    fn rejected(kind: AdmissionKind, errors: Vec<String>) -> Self {
        Self {
            ok: false,
            errors,
            resolved: None,
            rejection: Some(kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub ok: bool,
    pub errors: Vec<String>,
    pub elapsed_ms: u64,
    pub violation: Option<ViolationKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityMetrics {
    pub active_executions: usize,
    pub rejected_executions: u64,
    pub forced_terminations: u64,
}

pub struct Validator {
    config: EngineConfig,
    records: Mutex<HashMap<String, ValidationRecord>>,
    probe: Arc<dyn MemoryProbe>,
    rejected: AtomicU64,
    forced: AtomicU64,
}

impl Validator {
    pub fn new(config: EngineConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            records: Mutex::new(HashMap::new()),
            probe,
            rejected: AtomicU64::new(0),
            forced: AtomicU64::new(0),
        }
    }

    /// Checks a submission and, when it passes, registers its record.
    pub fn admit(&self, execution_id: &str, code: &str, requested: &RunConfig) -> Admission {
        let mut errors = Vec::new();
        if execution_id.trim().is_empty() {
            errors.push("execution id is empty".to_string());
        }
        if code.trim().is_empty() {
            errors.push("script code is empty".to_string());
        }
        if !errors.is_empty() {
            return self.reject(execution_id, AdmissionKind::Invalid, errors);
        }

        let (resolved, notices) = self.resolve(requested);
        // Sampled before taking the lock; reading /proc is I/O.
        let resident_mb = self.probe.resident_mb();

        let mut records = self.records.lock();
        if records.len() >= self.config.max_concurrent {
            let active = records.len();
            drop(records);
            return self.reject(
                execution_id,
                AdmissionKind::Capacity,
                vec![format!(
                    "{active} executions active, limit is {}",
                    self.config.max_concurrent
                )],
            );
        }
        if let Some(mb) = resident_mb
            && mb >= self.config.host_memory_ceiling_mb
        {
            drop(records);
            return self.reject(
                execution_id,
                AdmissionKind::HostMemory,
                vec![format!(
                    "engine resident memory {mb} MiB is at or above {} MiB",
                    self.config.host_memory_ceiling_mb
                )],
            );
        }
        if records.contains_key(execution_id) {
            drop(records);
            return self.reject(
                execution_id,
                AdmissionKind::Duplicate,
                vec![format!("execution {execution_id} is already registered")],
            );
        }
        records.insert(
            execution_id.to_string(),
            ValidationRecord {
                start_time: Instant::now(),
                config: resolved.clone(),
                resource_usage: ResourceUsage::default(),
            },
        );
        let active = records.len();
        drop(records);

        debug!(execution_id, active, "execution admitted");
        Admission {
            ok: true,
            errors: notices,
            resolved: Some(resolved),
            rejection: None,
        }
    }

    fn reject(&self, execution_id: &str, kind: AdmissionKind, errors: Vec<String>) -> Admission {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        info!(execution_id, reason = %kind.reason_code(), "admission rejected");
        Admission::rejected(kind, errors)
    }

    /// Clamps the requested settings into the configured ranges.
    pub fn resolve(&self, requested: &RunConfig) -> (ResolvedConfig, Vec<String>) {
        let c = &self.config;
        let mut notices = Vec::new();

        let browser_engine = match requested.browser_engine.as_deref() {
            None => DEFAULT_ENGINE.to_string(),
            Some(engine) if SUPPORTED_ENGINES.contains(&engine) => engine.to_string(),
            Some(engine) => {
                notices.push(format!(
                    "browser engine {engine:?} is not supported, using {DEFAULT_ENGINE}"
                ));
                DEFAULT_ENGINE.to_string()
            }
        };

        let resolved = ResolvedConfig {
            timeout_ms: requested
                .timeout_ms
                .unwrap_or(c.default_timeout_ms)
                .clamp(MIN_TIMEOUT_MS, c.max_timeout_ms.max(MIN_TIMEOUT_MS)),
            headless: requested.headless.unwrap_or(true),
            browser_engine,
            capture_screenshots: requested.capture_screenshots.unwrap_or(true),
            max_memory_mb: requested
                .max_memory_mb
                .unwrap_or(c.default_memory_mb)
                .clamp(MIN_MEMORY_MB, c.max_memory_mb.max(MIN_MEMORY_MB)),
            max_cpu_percent: requested
                .max_cpu_percent
                .unwrap_or(c.default_cpu_percent)
                .clamp(MIN_CPU_PERCENT, c.max_cpu_percent.max(MIN_CPU_PERCENT)),
        };
        (resolved, notices)
    }

    /// Compares elapsed time (and, when given, the child's memory) against
    /// the execution's limits. Only reports; never kills.
    pub fn monitor(&self, execution_id: &str, child_memory_mb: Option<u64>) -> MonitorReport {
        let mut records = self.records.lock();
        let Some(record) = records.get_mut(execution_id) else {
            return MonitorReport {
                ok: false,
                errors: vec![format!("no validation record for {execution_id}")],
                elapsed_ms: 0,
                violation: None,
            };
        };

        let elapsed = record.start_time.elapsed();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        record.resource_usage.execution_time_ms = elapsed_ms;
        let timeout_ms = record.config.timeout_ms;
        let memory_limit = u64::from(record.config.max_memory_mb);
        drop(records);

        let mut errors = Vec::new();
        let mut violation = None;
        if elapsed_ms > timeout_ms {
            errors.push(format!("execution exceeded its {timeout_ms}ms timeout"));
            violation = Some(ViolationKind::Timeout);
        } else if elapsed > self.config.absolute_timeout() {
            errors.push(format!(
                "execution exceeded the absolute {}ms ceiling",
                self.config.absolute_timeout_ms
            ));
            violation = Some(ViolationKind::Timeout);
        }
        if let Some(mb) = child_memory_mb
            && mb > memory_limit
        {
            errors.push(format!("sandbox uses {mb} MiB, limit is {memory_limit} MiB"));
            violation.get_or_insert(ViolationKind::ResourceLimit);
        }

        MonitorReport {
            ok: violation.is_none(),
            errors,
            elapsed_ms,
            violation,
        }
    }

    /// Drops the record once the execution has ended. Returns false if there
    /// was none.
    pub fn finalize(&self, execution_id: &str, outcome: impl fmt::Display) -> bool {
        let removed = self.records.lock().remove(execution_id).is_some();
        if removed {
            debug!(execution_id, %outcome, "validation record released");
        }
        removed
    }

    /// Drops the record of an execution that broke its limits.
    pub fn force_terminate(&self, execution_id: &str, reason: &str) -> bool {
        let removed = self.records.lock().remove(execution_id).is_some();
        self.rejected.fetch_add(1, Ordering::Relaxed);
        self.forced.fetch_add(1, Ordering::Relaxed);
        warn!(execution_id, reason, "execution force-terminated");
        removed
    }

    pub fn active_count(&self) -> usize {
        self.records.lock().len()
    }

    pub fn record(&self, execution_id: &str) -> Option<ValidationRecord> {
        self.records.lock().get(execution_id).cloned()
    }

    pub fn security_metrics(&self) -> SecurityMetrics {
        SecurityMetrics {
            active_executions: self.active_count(),
            rejected_executions: self.rejected.load(Ordering::Relaxed),
            forced_terminations: self.forced.load(Ordering::Relaxed),
        }
    }

    /// How often the orchestrator should call [`Validator::monitor`].
    pub fn monitor_interval(&self) -> Duration {
        self.config.monitor_interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        own: AtomicU64,
    }

    impl MemoryProbe for FixedProbe {
        fn resident_mb(&self) -> Option<u64> {
            Some(self.own.load(Ordering::Relaxed))
        }

        fn child_resident_mb(&self, _pid: u32) -> Option<u64> {
            None
        }
    }

    fn validator(config: EngineConfig) -> (Validator, Arc<FixedProbe>) {
        let probe = Arc::new(FixedProbe {
            own: AtomicU64::new(100),
        });
        (Validator::new(config, probe.clone()), probe)
    }

    const CODE: &str = "await page.goto('https://example.com');";

    // -----------------------------------------------------------------------
    // Admission
    // -----------------------------------------------------------------------

    #[test]
    fn clamps_requested_limits() {
        let (v, _) = validator(EngineConfig::default());
        let admission = v.admit(
            "a",
            CODE,
            &RunConfig {
                timeout_ms: Some(10),
                max_memory_mb: Some(1_000_000),
                max_cpu_percent: Some(0),
                ..RunConfig::default()
            },
        );
        assert!(admission.ok);
        let resolved = admission.resolved.unwrap();
        assert_eq!(resolved.timeout_ms, MIN_TIMEOUT_MS);
        assert_eq!(resolved.max_memory_mb, 1_024);
        assert_eq!(resolved.max_cpu_percent, MIN_CPU_PERCENT);
        assert_eq!(resolved.browser_engine, "chromium");
        assert!(resolved.headless);
    }

    #[test]
    fn applies_defaults() {
        let (v, _) = validator(EngineConfig::default());
        let (resolved, notices) = v.resolve(&RunConfig::default());
        assert!(notices.is_empty());
        assert_eq!(resolved.timeout_ms, 30_000);
        assert_eq!(resolved.max_memory_mb, 1_024);
        assert_eq!(resolved.max_cpu_percent, 50);
    }

    #[test]
    fn substitutes_unsupported_engine_and_says_so() {
        let (v, _) = validator(EngineConfig::default());
        let admission = v.admit(
            "a",
            CODE,
            &RunConfig {
                browser_engine: Some("netscape".into()),
                ..RunConfig::default()
            },
        );
        assert!(admission.ok);
        assert_eq!(admission.resolved.unwrap().browser_engine, "chromium");
        assert_eq!(admission.errors.len(), 1);
        assert!(admission.errors[0].contains("netscape"));
    }

    #[test]
    fn rejects_empty_input() {
        let (v, _) = validator(EngineConfig::default());
        let admission = v.admit("", " ", &RunConfig::default());
        assert!(!admission.ok);
        assert_eq!(admission.rejection, Some(AdmissionKind::Invalid));
        assert_eq!(admission.errors.len(), 2);
        assert_eq!(v.active_count(), 0);
    }

    #[test]
    fn enforces_capacity_and_duplicates() {
        let (v, _) = validator(EngineConfig::default());
        for i in 0..5 {
            assert!(v.admit(&format!("e{i}"), CODE, &RunConfig::default()).ok);
        }
        let sixth = v.admit("e5", CODE, &RunConfig::default());
        assert_eq!(sixth.rejection, Some(AdmissionKind::Capacity));

        assert!(v.finalize("e0", "completed"));
        let dup = v.admit("e1", CODE, &RunConfig::default());
        assert_eq!(dup.rejection, Some(AdmissionKind::Duplicate));
        assert!(v.admit("e5", CODE, &RunConfig::default()).ok);

        let metrics = v.security_metrics();
        assert_eq!(metrics.active_executions, 5);
        assert_eq!(metrics.rejected_executions, 2);
        assert_eq!(metrics.forced_terminations, 0);
    }

    #[test]
    fn rejects_when_host_memory_is_high() {
        let (v, probe) = validator(EngineConfig::default());
        probe.own.store(4_096, Ordering::Relaxed);
        let admission = v.admit("a", CODE, &RunConfig::default());
        assert_eq!(admission.rejection, Some(AdmissionKind::HostMemory));
        probe.own.store(100, Ordering::Relaxed);
        assert!(v.admit("a", CODE, &RunConfig::default()).ok);
    }

    #[test]
    fn concurrent_admission_never_overshoots() {
        let (v, _) = validator(EngineConfig::default());
        let v = Arc::new(v);
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let v = v.clone();
                std::thread::spawn(move || v.admit(&format!("e{i}"), CODE, &RunConfig::default()).ok)
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(v.active_count(), 5);
    }

    // -----------------------------------------------------------------------
    // Monitoring
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_timeout() {
        let (v, _) = validator(EngineConfig::default());
        let config = RunConfig {
            timeout_ms: Some(2_000),
            ..RunConfig::default()
        };
        assert!(v.admit("a", CODE, &config).ok);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        let report = v.monitor("a", None);
        assert!(report.ok);
        assert_eq!(report.elapsed_ms, 1_500);
        assert_eq!(v.record("a").unwrap().resource_usage.execution_time_ms, 1_500);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        let report = v.monitor("a", None);
        assert!(!report.ok);
        assert_eq!(report.violation, Some(ViolationKind::Timeout));
        // Monitoring never removes the record.
        assert_eq!(v.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_reports_child_memory() {
        let (v, _) = validator(EngineConfig::default());
        let config = RunConfig {
            max_memory_mb: Some(256),
            ..RunConfig::default()
        };
        assert!(v.admit("a", CODE, &config).ok);
        assert!(v.monitor("a", Some(200)).ok);
        let report = v.monitor("a", Some(300));
        assert_eq!(report.violation, Some(ViolationKind::ResourceLimit));
        assert!(report.errors[0].contains("300 MiB"));
    }

    #[test]
    fn monitor_unknown_execution() {
        let (v, _) = validator(EngineConfig::default());
        let report = v.monitor("missing", None);
        assert!(!report.ok);
        assert_eq!(report.violation, None);
    }

    #[test]
    fn force_terminate_counts_as_rejection() {
        let (v, _) = validator(EngineConfig::default());
        assert!(v.admit("a", CODE, &RunConfig::default()).ok);
        assert!(v.force_terminate("a", "timeout"));
        assert!(!v.finalize("a", "failed"));
        let metrics = v.security_metrics();
        assert_eq!(metrics.active_executions, 0);
        assert_eq!(metrics.rejected_executions, 1);
        assert_eq!(metrics.forced_terminations, 1);
    }
}
