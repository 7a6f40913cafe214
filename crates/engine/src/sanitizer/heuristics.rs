//! Semantic checks that run after the capability allowlist.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use super::rules::{
    self, ATOB_LITERAL, BLOCKED_SUBSTRINGS, CONSTRUCTOR_ACCESS, GOTO_LITERAL, INJECTION,
    OBFUSCATION,
};
use super::snippet;

/// Scheme-less targets and `about:blank` are allowed; they resolve against
/// the test's own base URL.
const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

/// Runs every heuristic and returns all findings.
pub(crate) fn check(masked: &str, stripped: &str, obfuscation_threshold: usize) -> Vec<String> {
    let mut errors = Vec::new();

    if let Some(re) = CONSTRUCTOR_ACCESS.as_ref()
        && let Some(m) = re.find(masked)
    {
        errors.push(format!("context escape via `{}`", snippet(m.as_str())));
    }

    let score = obfuscation_score(stripped);
    if score > obfuscation_threshold {
        errors.push(format!(
            "obfuscation score {score} exceeds threshold {obfuscation_threshold}"
        ));
    }

    errors.extend(check_encoded_payloads(stripped));

    for (name, re) in INJECTION.iter() {
        if let Some(m) = re.find(stripped) {
            errors.push(format!("injection idiom {name}: `{}`", snippet(m.as_str())));
        }
    }

    errors.extend(check_navigation_targets(stripped));
    errors
}

pub(crate) fn obfuscation_score(text: &str) -> usize {
    OBFUSCATION
        .as_ref()
        .map_or(0, |re| re.find_iter(text).count())
}

/// Decodes literal `atob` payloads and runs them through the denylist again.
fn check_encoded_payloads(stripped: &str) -> Vec<String> {
    let Some(re) = ATOB_LITERAL.as_ref() else {
        return Vec::new();
    };
    let mut errors = Vec::new();
    for caps in re.captures_iter(stripped) {
        let Some(literal) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let decoded = match STANDARD.decode(literal.as_str().trim()) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => continue,
        };
        if let Some((rule, fragment)) = rules::first_deny_match(&decoded) {
            errors.push(format!(
                "encoded payload matches {} (`{}`)",
                rule.name,
                snippet(&fragment)
            ));
            continue;
        }
        let lowered = decoded.to_lowercase();
        if let Some(blocked) = BLOCKED_SUBSTRINGS.iter().find(|b| lowered.contains(*b)) {
            errors.push(format!("encoded payload contains blocked text `{blocked}`"));
        }
    }
    errors
}

fn check_navigation_targets(stripped: &str) -> Vec<String> {
    let Some(re) = GOTO_LITERAL.as_ref() else {
        return Vec::new();
    };
    let mut errors = Vec::new();
    for caps in re.captures_iter(stripped) {
        let Some(target) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let target = target.as_str().trim();
        if target.eq_ignore_ascii_case("about:blank") {
            continue;
        }
        match url::Url::parse(target) {
            Ok(parsed) if ALLOWED_SCHEMES.contains(&parsed.scheme()) => {}
            Ok(parsed) => errors.push(format!(
                "navigation to `{}` uses disallowed scheme {}",
                snippet(target),
                parsed.scheme()
            )),
            Err(url::ParseError::RelativeUrlWithoutBase) => {}
            Err(e) => errors.push(format!("navigation target `{}` is invalid: {e}", snippet(target))),
        }
    }
    errors
}
