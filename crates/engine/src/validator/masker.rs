//! Per-execution masking of secret parameter values.
//!
//! Parameters whose key looks sensitive are treated as known secrets. Their
//! literal, base64 and percent-encoded spellings are replaced with `***`
//! wherever they show up in that execution's output.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use super::redact::is_sensitive_key;

const MASK: &str = "***";
/// Shorter values would mask too much unrelated output.
const MIN_SECRET_LEN: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    needles: Vec<String>,
}

impl SecretMasker {
    /// Collects secrets from top-level and nested parameters.
    pub fn from_parameters(parameters: &Map<String, Value>) -> Self {
        let mut secrets = Vec::new();
        collect_secrets(parameters, &mut secrets);
        Self::from_secrets(secrets)
    }

    pub fn from_secrets<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut needles = Vec::new();
        for secret in secrets {
            let secret = secret.as_ref();
            if secret.len() < MIN_SECRET_LEN {
                continue;
            }
            let encoded = percent_encode(secret);
            needles.push(secret.to_string());
            needles.push(STANDARD.encode(secret));
            if encoded != secret {
                needles.push(encoded);
            }
        }
        // Longest first so an encoding that contains the literal still
        // gets masked as a whole.
        needles.sort_by_key(|n| std::cmp::Reverse(n.len()));
        needles.dedup();
        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn mask_str(&self, text: &str) -> String {
        let mut out = text.to_string();
        for needle in &self.needles {
            if out.contains(needle.as_str()) {
                out = out.replace(needle.as_str(), MASK);
            }
        }
        out
    }

    pub fn mask_value(&self, value: &mut Value) {
        if self.is_empty() {
            return;
        }
        match value {
            Value::String(s) => *s = self.mask_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.mask_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.mask_value(v)),
            _ => {}
        }
    }
}

fn collect_secrets(map: &Map<String, Value>, out: &mut Vec<String>) {
    for (key, value) in map {
        match value {
            Value::String(s) if is_sensitive_key(key) => out.push(s.clone()),
            Value::Number(n) if is_sensitive_key(key) => out.push(n.to_string()),
            Value::Object(inner) => collect_secrets(inner, out),
            _ => {}
        }
    }
}

/// Same escaping as JavaScript's `encodeURIComponent`.
fn percent_encode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.bytes() {
        if byte.is_ascii_alphanumeric() || b"-_.!~*'()".contains(&byte) {
            out.push(char::from(byte));
        } else {
            out.push('%');
            out.push(hex_digit(byte >> 4));
            out.push(hex_digit(byte & 0x0f));
        }
    }
    out
}

fn hex_digit(nibble: u8) -> char {
    match nibble {
        0..=9 => char::from(b'0' + nibble),
        _ => char::from(b'A' + nibble - 10),
    }
}
