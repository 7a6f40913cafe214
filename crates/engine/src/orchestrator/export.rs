//! Validation and merging of `[EXPORT]` payloads into an execution result.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::error::EngineError;
use crate::validator::redact;

pub const MAX_EXPORT_BYTES: usize = 64 * 1024;
pub const MAX_EXPORT_KEYS: usize = 100;
pub const MAX_EXPORT_DEPTH: usize = 10;
/// Ceiling on the merged result, excluding metadata.
pub const MAX_RESULT_KEYS: usize = 1_000;
pub const METADATA_KEY: &str = "_metadata";

/// Parses and redacts one export payload.
pub fn parse(payload: &str) -> Result<Map<String, Value>, EngineError> {
    if payload.len() > MAX_EXPORT_BYTES {
        return Err(EngineError::MalformedExport(format!(
            "payload is {} bytes, limit is {MAX_EXPORT_BYTES}",
            payload.len()
        )));
    }
    let value: Value = serde_json::from_str(payload)
        .map_err(|e| EngineError::MalformedExport(format!("invalid JSON: {e}")))?;
    let Value::Object(map) = redact::redact(&value) else {
        return Err(EngineError::MalformedExport(
            "payload must be a JSON object".into(),
        ));
    };
    if map.len() > MAX_EXPORT_KEYS {
        return Err(EngineError::MalformedExport(format!(
            "payload has {} keys, limit is {MAX_EXPORT_KEYS}",
            map.len()
        )));
    }
    let depth = depth(&Value::Object(map.clone()));
    if depth > MAX_EXPORT_DEPTH {
        return Err(EngineError::MalformedExport(format!(
            "payload nests {depth} levels, limit is {MAX_EXPORT_DEPTH}"
        )));
    }
    if map.contains_key(METADATA_KEY) {
        return Err(EngineError::MalformedExport(format!(
            "{METADATA_KEY} is reserved"
        )));
    }
    Ok(map)
}

/// Shallow-merges `export` into `result` and updates its metadata.
pub fn merge(result: &mut Map<String, Value>, export: Map<String, Value>) -> Result<(), EngineError> {
    let new_keys = export.keys().filter(|k| !result.contains_key(*k)).count();
    let existing = result.keys().filter(|k| *k != METADATA_KEY).count();
    if existing + new_keys > MAX_RESULT_KEYS {
        return Err(EngineError::MalformedExport(format!(
            "result would hold {} keys, limit is {MAX_RESULT_KEYS}",
            existing + new_keys
        )));
    }

    let count = result
        .get(METADATA_KEY)
        .and_then(|m| m.get("exportCount"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    result.extend(export);
    result.insert(
        METADATA_KEY.to_string(),
        json!({
            "exportCount": count + 1,
            "lastExportTime": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }),
    );
    Ok(())
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_and_counts_exports() {
        let mut result = Map::new();
        merge(&mut result, parse(r#"{"title": "Home", "count": 1}"#).unwrap()).unwrap();
        merge(&mut result, parse(r#"{"count": 2}"#).unwrap()).unwrap();

        assert_eq!(result["title"], "Home");
        assert_eq!(result["count"], 2);
        assert_eq!(result[METADATA_KEY]["exportCount"], 2);
        assert!(result[METADATA_KEY]["lastExportTime"].is_string());
    }

    #[test]
    fn rejects_malformed_payloads() {
        for payload in ["not json", "[1, 2]", "42", r#"{"_metadata": {}}"#] {
            assert!(
                matches!(parse(payload), Err(EngineError::MalformedExport(_))),
                "accepted {payload}"
            );
        }

        let big = format!(r#"{{"blob": "{}"}}"#, "x".repeat(MAX_EXPORT_BYTES));
        assert!(parse(&big).is_err());

        let wide: Map<String, Value> = (0..=MAX_EXPORT_KEYS)
            .map(|i| (format!("k{i}"), Value::from(i)))
            .collect();
        assert!(parse(&Value::Object(wide).to_string()).is_err());

        let mut deep = Value::from(1);
        for _ in 0..MAX_EXPORT_DEPTH {
            deep = json!({ "n": deep });
        }
        assert!(parse(&deep.to_string()).is_ok());
        assert!(parse(&json!({ "n": deep }).to_string()).is_err());
    }

    #[test]
    fn redacts_exported_values() {
        let map = parse(r#"{"password": "hunter2", "contact": "alice@example.com"}"#).unwrap();
        assert_eq!(map["password"], "[REDACTED]");
        assert_eq!(map["contact"], "[EMAIL]");
    }

    #[test]
    fn caps_result_size() {
        let mut result: Map<String, Value> = (0..MAX_RESULT_KEYS)
            .map(|i| (format!("k{i}"), Value::from(i)))
            .collect();
        let err = merge(&mut result, parse(r#"{"extra": 1}"#).unwrap()).unwrap_err();
        assert!(err.to_string().contains("limit is 1000"));
        // Overwriting an existing key is fine.
        assert!(merge(&mut result, parse(r#"{"k0": 5}"#).unwrap()).is_ok());
    }
}
