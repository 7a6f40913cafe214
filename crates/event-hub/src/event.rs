use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Log,
    Status,
    Progress,
    Screenshot,
    Complete,
    Error,
    Cancelled,
    ResultUpdate,
}

impl EventKind {
    /// Events that close out an execution; exactly one is emitted per run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// Wire shape: `{type, executionId, data, timestamp}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub execution_id: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionEvent {
    pub fn new(kind: EventKind, execution_id: impl Into<String>, data: Value) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn serializes_wire_names() {
        let event = ExecutionEvent::new(EventKind::ResultUpdate, "e-1", json!({"a": 1}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "RESULT_UPDATE");
        assert_eq!(value["executionId"], "e-1");
        assert_eq!(value["data"]["a"], 1);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn terminal_kinds() {
        assert!(EventKind::Complete.is_terminal());
        assert!(EventKind::Cancelled.is_terminal());
        assert!(!EventKind::Log.is_terminal());
        assert!(!EventKind::Status.is_terminal());
    }
}
