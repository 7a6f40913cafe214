//! Untrusted script execution engine.
//!
//! Submissions flow through admission ([`validator::Validator`]), static
//! screening ([`sanitizer::Sanitizer`]) and finally the
//! [`orchestrator::Orchestrator`], which runs each script in a sandbox and
//! relays its parsed output through the event hub.
//!
//! The sanitizer is an advisory first-pass filter. Containment comes from the
//! sandbox backend; see `sandbox::IsolationLevel`.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod quarantine;
pub mod sanitizer;
pub mod types;
pub mod validator;

pub use collaborators::{
    Collaborators, EngineMetrics, HttpPersistence, MetricEvent, MetricsSink, MetricsSnapshot,
    NoopPersistence, PersistenceSink, ScriptCatalog, ScriptInfo, StaticCatalog,
};
pub use config::EngineConfig;
pub use error::{AdmissionKind, EngineError, EngineResult, ReasonCode, ViolationKind};
pub use orchestrator::{
    Execution, ExecutionError, ExecutionStatus, LogEntry, LogLevel, Orchestrator, SecurityInfo,
    Submitted,
};
pub use quarantine::{QuarantineEntry, QuarantineRequest, QuarantineStore, Severity};
pub use sanitizer::{SanitizationResult, Sanitizer, SanitizerLimits, Stage};
pub use types::{ResolvedConfig, RunConfig, SubmitRequest};
pub use validator::{MemoryProbe, SecretMasker, SecurityMetrics, SysinfoProbe, Validator};
