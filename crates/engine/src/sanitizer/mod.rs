//! Static screening of submitted scripts.
//!
//! [`Sanitizer::sanitize`] runs a fixed sequence of stages and stops at the
//! first one that reports findings. Code that passes every stage comes back
//! rewritten: comments stripped, denylisted fragments neutralized, and the
//! whole payload wrapped so ambient module handles are unavailable.
//!
//! This is an advisory filter built on pattern matching. It raises the bar
//! for casual abuse; containment is the sandbox's job.

mod heuristics;
mod lexer;
mod rewrite;
mod rules;

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::quarantine::Severity;

pub use rewrite::INERT_MARKER;

const SNIPPET_CHARS: usize = 80;
const ADVISORY: &str = "advisory filter, not a security boundary";

/// Size and shape ceilings applied before any pattern matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizerLimits {
    pub max_bytes: usize,
    pub max_lines: usize,
    pub max_nesting: usize,
    pub max_loops: usize,
    pub obfuscation_threshold: usize,
}

impl Default for SanitizerLimits {
    fn default() -> Self {
        Self {
            max_bytes: 100_000,
            max_lines: 2_000,
            max_nesting: 10,
            max_loops: 20,
            obfuscation_threshold: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Basic,
    Structure,
    Denylist,
    Allowlist,
    Heuristics,
    Final,
}

impl Stage {
    /// Quarantine severity for a rejection at this stage.
    pub fn severity(self) -> Severity {
        match self {
            Self::Denylist => Severity::Critical,
            Self::Allowlist | Self::Heuristics => Severity::High,
            Self::Structure => Severity::Low,
            Self::Basic | Self::Final => Severity::Medium,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Basic => "basic",
            Self::Structure => "structure",
            Self::Denylist => "denylist",
            Self::Allowlist => "allowlist",
            Self::Heuristics => "heuristics",
            Self::Final => "final",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationMetadata {
    pub duration_ms: u64,
    pub original_length: usize,
    pub sanitized_length: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub sanitized_code: Option<String>,
    pub sanitization_id: String,
    pub metadata: SanitizationMetadata,
    /// Stage that rejected the code, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_stage: Option<Stage>,
}

impl SanitizationResult {
    pub fn severity(&self) -> Option<Severity> {
        self.rejected_stage.map(Stage::severity)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    limits: SanitizerLimits,
}

impl Sanitizer {
    pub fn new(limits: SanitizerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SanitizerLimits {
        &self.limits
    }

    /// Screens `code`. Never errors: rejected input comes back with
    /// `is_valid == false` and the findings in `errors`.
    pub fn sanitize(&self, code: &str) -> SanitizationResult {
        let started = Instant::now();
        let sanitization_id = uuid::Uuid::new_v4().to_string();

        let outcome = self.run_stages(code);
        let metadata = |sanitized_length| SanitizationMetadata {
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            original_length: code.len(),
            sanitized_length,
        };

        match outcome {
            Ok(sanitized) => {
                debug!(
                    sanitization_id = %sanitization_id,
                    original = code.len(),
                    sanitized = sanitized.len(),
                    "script accepted"
                );
                SanitizationResult {
                    is_valid: true,
                    errors: Vec::new(),
                    metadata: metadata(sanitized.len()),
                    sanitized_code: Some(sanitized),
                    sanitization_id,
                    rejected_stage: None,
                }
            }
            Err((stage, errors)) => {
                info!(
                    sanitization_id = %sanitization_id,
                    stage = %stage,
                    findings = errors.len(),
                    "script rejected"
                );
                SanitizationResult {
                    is_valid: false,
                    errors,
                    sanitized_code: None,
                    sanitization_id,
                    metadata: metadata(0),
                    rejected_stage: Some(stage),
                }
            }
        }
    }

    fn run_stages(&self, code: &str) -> Result<String, (Stage, Vec<String>)> {
        reject_if(Stage::Basic, self.basic(code))?;

        let scan = lexer::scan(code).map_err(|e| (Stage::Structure, vec![e.to_string()]))?;
        reject_if(Stage::Structure, self.structure(&scan))?;

        if let Some((rule, fragment)) = rules::first_deny_match(&scan.stripped) {
            return Err((
                Stage::Denylist,
                vec![format!(
                    "denylist rule {} ({}) matched `{}`; {ADVISORY}",
                    rule.name,
                    rule.message,
                    snippet(&fragment)
                )],
            ));
        }

        reject_if(Stage::Allowlist, allowlist(&scan.masked))?;
        reject_if(
            Stage::Heuristics,
            heuristics::check(
                &scan.masked,
                &scan.stripped,
                self.limits.obfuscation_threshold,
            ),
        )?;

        let payload = rewrite::neutralize(&scan.stripped);
        if let Some((rule, fragment)) = rules::first_deny_match(&payload) {
            return Err((
                Stage::Final,
                vec![format!(
                    "rewritten script still matches {} (`{}`); {ADVISORY}",
                    rule.name,
                    snippet(&fragment)
                )],
            ));
        }

        let wrapped = rewrite::wrap(&payload);
        lexer::scan(&wrapped)
            .map_err(|e| (Stage::Final, vec![format!("rewritten script is malformed: {e}")]))?;
        Ok(wrapped)
    }

    fn basic(&self, code: &str) -> Vec<String> {
        let mut errors = Vec::new();
        if code.trim().is_empty() {
            errors.push("script is empty".to_string());
            return errors;
        }
        if code.len() > self.limits.max_bytes {
            errors.push(format!(
                "script is {} bytes, limit is {}",
                code.len(),
                self.limits.max_bytes
            ));
        }
        let lines = code.lines().count();
        if lines > self.limits.max_lines {
            errors.push(format!(
                "script has {lines} lines, limit is {}",
                self.limits.max_lines
            ));
        }

        let lowered = code.to_lowercase();
        for blocked in rules::BLOCKED_SUBSTRINGS {
            if lowered.contains(blocked) {
                errors.push(format!("blocked text `{blocked}`"));
            }
        }
        if let Some(pipe) = rules::SHELL_PIPE.as_ref().and_then(|re| re.find(&lowered)) {
            errors.push(format!("blocked shell pipe `{}`", pipe.as_str().trim()));
        }

        if let Some((index, ch)) = code.char_indices().find(|(_, c)| !is_printable(*c)) {
            errors.push(format!(
                "non-printable character U+{:04X} at byte {index}",
                u32::from(ch)
            ));
        }
        errors
    }

    fn structure(&self, scan: &lexer::Scan) -> Vec<String> {
        let mut errors = Vec::new();
        if scan.max_brace_depth > self.limits.max_nesting {
            errors.push(format!(
                "nesting depth {} exceeds {}",
                scan.max_brace_depth, self.limits.max_nesting
            ));
        }
        let loops = rules::LOOP_KEYWORD
            .as_ref()
            .map_or(0, |re| re.find_iter(&scan.masked).count());
        if loops > self.limits.max_loops {
            errors.push(format!(
                "{loops} loop constructs, limit is {}",
                self.limits.max_loops
            ));
        }
        errors
    }
}

fn reject_if(stage: Stage, errors: Vec<String>) -> Result<(), (Stage, Vec<String>)> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err((stage, errors))
    }
}

/// Checks every `receiver.method(` call site against the capability tables.
fn allowlist(masked: &str) -> Vec<String> {
    let Some(re) = rules::CALL_SITE.as_ref() else {
        return vec!["call-site matcher unavailable".to_string()];
    };
    let mut errors = Vec::new();
    for caps in re.captures_iter(masked) {
        let receiver = caps.get(1).map(|m| m.as_str());
        let Some(method) = caps.get(2).map(|m| m.as_str()) else {
            continue;
        };
        let allowed = match receiver {
            Some(r) if rules::RESTRICTED_RECEIVERS.contains(&r) => false,
            Some(r) => match rules::QUALIFIED.iter().find(|(ns, _)| *ns == r) {
                Some((_, methods)) => methods.contains(&method),
                None => rules::GENERIC_METHODS.contains(&method),
            },
            None => rules::GENERIC_METHODS.contains(&method),
        };
        if !allowed {
            let call = match receiver {
                Some(r) => format!("{r}.{method}()"),
                None => format!(".{method}()"),
            };
            if !errors.iter().any(|e: &String| e.contains(&call)) {
                errors.push(format!("call to {call} is not allowed"));
            }
        }
    }
    errors
}

fn is_printable(c: char) -> bool {
    match c {
        '\t' | '\n' | '\r' => true,
        c if c.is_control() => false,
        '\u{FEFF}' | '\u{200B}'..='\u{200D}' | '\u{2060}' => false,
        '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}' => false,
        _ => true,
    }
}

/// Fragment for an error message, cut at a char boundary.
pub(crate) fn snippet(text: &str) -> String {
    let mut out: String = text.chars().take(SNIPPET_CHARS).collect();
    if text.chars().count() > SNIPPET_CHARS {
        out.push_str("...");
    }
    out
}
