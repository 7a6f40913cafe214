use std::fmt;

use serde::{Deserialize, Serialize};

/// Machine-readable failure reason carried on errors, executions and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    AdmissionCapacity,
    AdmissionDuplicate,
    AdmissionInvalid,
    AdmissionHostMemory,
    SanitizationRejected,
    SandboxLaunch,
    SandboxRuntime,
    Timeout,
    ResourceLimit,
    MalformedExport,
    NotFound,
    Cancelled,
    HostFault,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdmissionCapacity => "ADMISSION_CAPACITY",
            Self::AdmissionDuplicate => "ADMISSION_DUPLICATE",
            Self::AdmissionInvalid => "ADMISSION_INVALID",
            Self::AdmissionHostMemory => "ADMISSION_HOST_MEMORY",
            Self::SanitizationRejected => "SANITIZATION_REJECTED",
            Self::SandboxLaunch => "SANDBOX_LAUNCH",
            Self::SandboxRuntime => "SANDBOX_RUNTIME",
            Self::Timeout => "TIMEOUT",
            Self::ResourceLimit => "RESOURCE_LIMIT",
            Self::MalformedExport => "MALFORMED_EXPORT",
            Self::NotFound => "NOT_FOUND",
            Self::Cancelled => "CANCELLED",
            Self::HostFault => "HOST_FAULT",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    Capacity,
    Duplicate,
    Invalid,
    HostMemory,
}

impl AdmissionKind {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::Capacity => ReasonCode::AdmissionCapacity,
            Self::Duplicate => ReasonCode::AdmissionDuplicate,
            Self::Invalid => ReasonCode::AdmissionInvalid,
            Self::HostMemory => ReasonCode::AdmissionHostMemory,
        }
    }
}

/// Which ceiling a running execution broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Timeout,
    ResourceLimit,
}

impl ViolationKind {
    pub fn reason_code(self) -> ReasonCode {
        match self {
            Self::Timeout => ReasonCode::Timeout,
            Self::ResourceLimit => ReasonCode::ResourceLimit,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::ResourceLimit => f.write_str("resource limit"),
        }
    }
}

/// Every message in here has already been redacted.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("admission rejected: {message}")]
    Admission {
        kind: AdmissionKind,
        message: String,
        errors: Vec<String>,
    },

    #[error("sanitization rejected: {}", errors.join("; "))]
    Sanitization {
        sanitization_id: String,
        quarantine_id: String,
        errors: Vec<String>,
    },

    #[error("sandbox launch failed: {0}")]
    SandboxLaunch(String),

    #[error("sandbox runtime error: {0}")]
    SandboxRuntime(String),

    #[error("resource violation ({kind}): {message}")]
    ResourceViolation { kind: ViolationKind, message: String },

    #[error("malformed export: {0}")]
    MalformedExport(String),

    #[error("execution not found: {0}")]
    NotFound(String),
}

impl EngineError {
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::Admission { kind, .. } => kind.reason_code(),
            Self::Sanitization { .. } => ReasonCode::SanitizationRejected,
            Self::SandboxLaunch(_) => ReasonCode::SandboxLaunch,
            Self::SandboxRuntime(_) => ReasonCode::SandboxRuntime,
            Self::ResourceViolation { kind, .. } => kind.reason_code(),
            Self::MalformedExport(_) => ReasonCode::MalformedExport,
            Self::NotFound(_) => ReasonCode::NotFound,
        }
    }

    /// Individual findings behind the error, for callers that list them.
    pub fn details(&self) -> Vec<String> {
        match self {
            Self::Admission { errors, .. } | Self::Sanitization { errors, .. } => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
