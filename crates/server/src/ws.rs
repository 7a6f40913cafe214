//! Channel protocol: JSON text frames in both directions.
//!
//! Clients send `{"type": "SUBSCRIBE", "executionId": ...}` and friends;
//! every request gets exactly one control reply, queued on the same channel
//! as the execution events so the two never reorder.

use std::sync::Arc;

use engine::{AdmissionKind, EngineError, Execution, Orchestrator, SubmitRequest, Submitted};
use event_hub::ChannelId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Reason sent back for frames that are not a known request.
pub const BAD_REQUEST: &str = "BAD_REQUEST";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    Subscribe { execution_id: String },
    Unsubscribe { execution_id: String },
    Ping,
    Submit(Box<SubmitRequest>),
    Cancel { execution_id: String },
    Get { execution_id: String },
    List,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    rename_all = "SCREAMING_SNAKE_CASE",
    rename_all_fields = "camelCase"
)]
pub enum ServerReply {
    Pong,
    Subscribed {
        execution_id: String,
    },
    Unsubscribed {
        execution_id: String,
        removed: bool,
    },
    Submitted(Submitted),
    CancelResult {
        execution_id: String,
        cancelled: bool,
    },
    Execution {
        execution: Box<Execution>,
    },
    Executions {
        executions: Vec<Execution>,
    },
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
        reason: String,
        message: String,
        errors: Vec<String>,
    },
}

impl ServerReply {
    fn rejected(execution_id: Option<String>, err: &EngineError) -> Self {
        Self::Rejected {
            execution_id,
            reason: err.reason_code().as_str().to_string(),
            message: err.to_string(),
            errors: err.details(),
        }
    }

    fn bad_request(message: String) -> Self {
        Self::Rejected {
            execution_id: None,
            reason: BAD_REQUEST.to_string(),
            message,
            errors: Vec::new(),
        }
    }

    pub fn to_frame(&self) -> Option<Arc<str>> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Arc::from(json)),
            Err(e) => {
                warn!(error = %e, "failed to serialize reply");
                None
            }
        }
    }
}

/// Handle one inbound text frame from `channel`.
pub async fn handle(orchestrator: &Orchestrator, channel: ChannelId, text: &str) -> ServerReply {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(channel, error = %e, "unparseable frame");
            return ServerReply::bad_request(format!("invalid message: {e}"));
        }
    };
    let hub = orchestrator.hub();

    match message {
        ClientMessage::Ping => ServerReply::Pong,
        ClientMessage::Subscribe { execution_id } => {
            hub.subscribe(channel, &execution_id);
            ServerReply::Subscribed { execution_id }
        }
        ClientMessage::Unsubscribe { execution_id } => {
            let removed = hub.unsubscribe(channel, &execution_id);
            ServerReply::Unsubscribed {
                execution_id,
                removed,
            }
        }
        ClientMessage::Submit(request) => submit(orchestrator, channel, *request).await,
        ClientMessage::Cancel { execution_id } => {
            let cancelled = orchestrator.cancel(&execution_id);
            ServerReply::CancelResult {
                execution_id,
                cancelled,
            }
        }
        ClientMessage::Get { execution_id } => match orchestrator.get_execution(&execution_id) {
            Some(execution) => ServerReply::Execution {
                execution: Box::new(execution),
            },
            None => {
                let err = EngineError::NotFound(execution_id.clone());
                ServerReply::rejected(Some(execution_id), &err)
            }
        },
        ClientMessage::List => ServerReply::Executions {
            executions: orchestrator.get_all_executions(),
        },
    }
}

/// Subscribes the submitter before launch so it sees the first STATUS.
async fn submit(
    orchestrator: &Orchestrator,
    channel: ChannelId,
    mut request: SubmitRequest,
) -> ServerReply {
    let hub = orchestrator.hub();
    let execution_id = request
        .execution_id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();
    let already = hub.is_subscribed(channel, &execution_id);
    hub.subscribe(channel, &execution_id);

    match orchestrator.submit(request).await {
        Ok(submitted) => ServerReply::Submitted(submitted),
        Err(err) => {
            // Nothing will ever be published for a run that never started.
            let never_started = match &err {
                EngineError::Admission { kind, .. } => *kind != AdmissionKind::Duplicate,
                EngineError::Sanitization { .. } => true,
                _ => false,
            };
            if never_started && !already {
                hub.unsubscribe(channel, &execution_id);
            }
            ServerReply::rejected(Some(execution_id), &err)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn parses_client_messages() {
        let msg: ClientMessage =
            serde_json::from_value(json!({"type": "SUBSCRIBE", "executionId": "e-1"})).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Subscribe {
                execution_id: "e-1".into()
            }
        );

        let msg: ClientMessage = serde_json::from_value(json!({"type": "PING"})).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        let msg: ClientMessage = serde_json::from_value(json!({
            "type": "SUBMIT",
            "scriptId": "login",
            "code": "await page.goto('https://example.com');",
            "parameters": {"user": "alice"},
            "config": {"timeoutMs": 5000}
        }))
        .unwrap();
        let ClientMessage::Submit(request) = msg else {
            panic!("expected SUBMIT, got {msg:?}");
        };
        assert_eq!(request.script_id, "login");
        assert_eq!(request.config.timeout_ms, Some(5000));
        assert!(request.execution_id.is_none());
    }

    #[test]
    fn rejects_unknown_types() {
        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "EXPLODE"})).is_err());
        assert!(serde_json::from_value::<ClientMessage>(json!({"type": "SUBSCRIBE"})).is_err());
    }

    #[test]
    fn replies_use_wire_names() {
        let frame = ServerReply::CancelResult {
            execution_id: "e-1".into(),
            cancelled: true,
        }
        .to_frame()
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "CANCEL_RESULT", "executionId": "e-1", "cancelled": true})
        );

        let err = EngineError::NotFound("e-9".into());
        let frame = ServerReply::rejected(Some("e-9".into()), &err)
            .to_frame()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "REJECTED");
        assert_eq!(value["reason"], "NOT_FOUND");
        assert_eq!(value["executionId"], "e-9");

        let frame = ServerReply::bad_request("nope".into()).to_frame().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["reason"], BAD_REQUEST);
        assert!(value.get("executionId").is_none());
    }
}
